mod file;

pub use file::{
    load_config, load_config_str, BackupSettings, Binaries, ConfigError, CustodianConfig,
    NotifyConfig, VerificationSettings,
};
