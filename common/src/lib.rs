pub mod config;
pub mod connectivity;
pub mod ota;
pub mod outputs;
pub mod types;

pub use config::{DecodedConfig, DeviceConfig, LegacyDeviceConfig};
pub use connectivity::{ConnDirective, ConnMode, ConnectivityState, NetworkEvent, StartupPlan};
pub use ota::{FirmwarePartition, OtaError, OtaErrorKind, UpdateManifest};
pub use outputs::{Channel, Command, CommandError, CommandOutcome, DriverAction, OutputState};
pub use types::{
    ConfigUpdate, ControlRequest, GpioTestRequest, OtaApplyRequest, PairRequest, StatusResponse,
};
