use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const ENV_CONFIG_PATH: &str = "ROOTSIM_CONFIG";

/// Run parameters, loaded from a TOML file named by `--input` or the
/// `ROOTSIM_CONFIG` environment variable (§6). CLI flags take
/// precedence over file values; `rootsim-cli` applies that override
/// after loading.
#[derive(Debug, Deserialize, Clone)]
pub struct SimConfig {
    #[serde(default = "default_np")]
    pub np: usize,
    #[serde(default = "default_lp")]
    pub lp: usize,
    #[serde(default)]
    pub input: Option<PathBuf>,
    #[serde(default = "default_gvt_period_ms")]
    pub gvt_period_ms: u64,
    #[serde(default = "default_ckpt_period")]
    pub ckpt_period: u32,
    #[serde(default = "default_region_len")]
    pub region_len: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            np: default_np(),
            lp: default_lp(),
            input: None,
            gvt_period_ms: default_gvt_period_ms(),
            ckpt_period: default_ckpt_period(),
            region_len: default_region_len(),
        }
    }
}

impl SimConfig {
    /// Load from `path` if given, falling back to `ROOTSIM_CONFIG`,
    /// falling back to defaults if neither is set or the file can't
    /// be read/parsed.
    pub fn load(path: Option<&std::path::Path>) -> Self {
        let path = path.map(PathBuf::from).or_else(|| {
            std::env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from)
        });
        let Some(path) = path else {
            return Self::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub fn gvt_period(&self) -> Duration {
        Duration::from_millis(self.gvt_period_ms)
    }
}

fn default_np() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}
fn default_lp() -> usize {
    1
}
fn default_gvt_period_ms() -> u64 {
    100
}
fn default_ckpt_period() -> u32 {
    10
}
fn default_region_len() -> usize {
    1 << 20
}
