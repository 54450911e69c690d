pub mod settings;

pub use settings::{default_config_path, default_log_dir, Config, UrlMode};
