pub mod config;
pub mod influx;
pub mod provisioning;
pub mod reading;
pub mod scheduler;

pub use config::{
    BootPlan, ConfigError, DatabaseConfig, DeviceConfig, NetworkConfig, StoredConfig,
    DEFAULT_ORG, DEFAULT_REPORT_INTERVAL_MS, DEVICE_TAG,
};
pub use influx::{UploadError, UploadStatus, WriteRequest, UPLOAD_TIMEOUT};
pub use provisioning::{ProvisioningRequest, ProvisioningResponse, ProvisioningView};
pub use reading::{Reading, SensorError};
pub use scheduler::{LinkAction, LinkSupervisor, ReportCycle, ReportScheduler, TickAction};
