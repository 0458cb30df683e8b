use crate::error::ConfigError;
use crate::types::GridParams;
use std::env;

/// Position-size limit for reduce-only mode: either an absolute BTC
/// threshold or a ratio of notional to `initial_asset`. Exactly one variant
/// is ever constructed — see `Config::from_env`.
#[derive(Debug, Clone, Copy)]
pub enum SizeLimit {
    Absolute { limit: f64, release: f64 },
    Ratio { limit: f64, release: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutOfScheduleAction {
    Nothing,
    Auto,
    Immediately,
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub position_losscut_pct: Option<f64>,
    pub position_take_profit_pct: Option<f64>,
    pub asset_losscut_pct: Option<f64>,
    pub asset_take_profit_pct: Option<f64>,
    pub balance_recovery_enabled: bool,
    pub initial_balance_usd: Option<f64>,
    pub recovery_enforce_level_usd: Option<f64>,
    pub leverage: f64,
    pub size_limit: Option<SizeLimit>,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub schedule_type: String,
    pub out_of_schedule_action: OutOfScheduleAction,
}

/// Every `EDGEX_*` variable parsed once at process start. Components receive
/// a shared reference; no component reads the environment after boot.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub account_id: String,
    pub stark_private_key: String,
    pub symbol: String,
    pub poll_interval_sec: f64,

    pub grid: GridParams,
    pub grid_mode: GridModeConfig,

    pub risk: RiskConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct GridModeConfig {
    pub box_mode: bool,
    pub bin_mode: bool,
    pub follow_enable: bool,
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_f64(key: &str, default: f64) -> Result<f64, ConfigError> {
    match env_str(key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), v)),
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize, ConfigError> {
    match env_str(key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), v)),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_str(key) {
        None => default,
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
    }
}

fn env_opt_f64(key: &str) -> Result<Option<f64>, ConfigError> {
    match env_str(key) {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), v)),
    }
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        let _ = dotenvy::dotenv();

        let base_url = env_str("EDGEX_BASE_URL")
            .unwrap_or_else(|| "https://api.edgex.exchange".to_string());
        let account_id =
            env_str("EDGEX_ACCOUNT_ID").ok_or(ConfigError::MissingRequired("EDGEX_ACCOUNT_ID"))?;
        let stark_private_key = env_str("EDGEX_STARK_PRIVATE_KEY")
            .ok_or(ConfigError::MissingRequired("EDGEX_STARK_PRIVATE_KEY"))?;
        let symbol = env_str("EDGEX_SYMBOL")
            .or_else(|| env_str("EDGEX_CONTRACT_ID"))
            .ok_or(ConfigError::MissingRequired("EDGEX_SYMBOL"))?;

        let poll_interval_sec = env_f64("EDGEX_POLL_INTERVAL_SEC", 1.5)?.max(1.5);

        let grid = GridParams {
            price_tick: env_f64("EDGEX_PRICE_TICK", 0.1)?,
            step_usd: env_f64("EDGEX_GRID_STEP_USD", 50.0)?,
            first_offset_usd: env_f64("EDGEX_GRID_FIRST_OFFSET_USD", 100.0)?,
            levels: env_usize("EDGEX_GRID_LEVELS_PER_SIDE", 10)?,
            base_size: env_f64("EDGEX_GRID_SIZE", 0.01)?,
            op_spacing_sec: env_f64("EDGEX_GRID_OP_SPACING_SEC", 0.4)?,
            max_new_per_loop: env_usize("EDGEX_GRID_MAX_NEW_PER_LOOP", 0)?,
            enforce_levels: env_bool("EDGEX_GRID_ENFORCE_LEVELS", true),
            active_sync_every: env_usize("EDGEX_GRID_ACTIVE_SYNC_EVERY", 3)? as u64,
            follow_slack_steps: env_usize("EDGEX_GRID_FOLLOW_SLACK_STEPS", 1)? as i64,
            max_shift_per_loop: env_usize("EDGEX_GRID_MAX_SHIFT_PER_LOOP", 1)?,
        };

        let grid_mode = GridModeConfig {
            box_mode: env_bool("EDGEX_GRID_BOX_MODE", true),
            bin_mode: env_bool("EDGEX_GRID_BIN_MODE", false),
            follow_enable: env_bool("EDGEX_GRID_FOLLOW_ENABLE", false),
        };

        let abs_limit = env_opt_f64("EDGEX_POSITION_SIZE_LIMIT_BTC")?;
        let abs_release = env_opt_f64("EDGEX_POSITION_SIZE_REDUCE_ONLY_BTC")?;
        let ratio_limit = env_opt_f64("EDGEX_POSITION_SIZE_LIMIT_RATIO")?;
        let ratio_release = env_opt_f64("EDGEX_POSITION_SIZE_REDUCE_ONLY_RATIO")?;

        let size_limit = match (abs_limit, ratio_limit) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::ConflictingLimits(
                    "both EDGEX_POSITION_SIZE_LIMIT_BTC and EDGEX_POSITION_SIZE_LIMIT_RATIO are set",
                ))
            }
            (Some(limit), None) => {
                let release = abs_release.unwrap_or(limit * 0.8);
                if release >= limit {
                    return Err(ConfigError::ConflictingLimits(
                        "EDGEX_POSITION_SIZE_REDUCE_ONLY_BTC must be below the limit",
                    ));
                }
                Some(SizeLimit::Absolute { limit, release })
            }
            (None, Some(limit)) => {
                let release = ratio_release.unwrap_or(limit * 0.8);
                if release >= limit {
                    return Err(ConfigError::ConflictingLimits(
                        "EDGEX_POSITION_SIZE_REDUCE_ONLY_RATIO must be below the limit",
                    ));
                }
                Some(SizeLimit::Ratio { limit, release })
            }
            (None, None) => None,
        };

        let risk = RiskConfig {
            position_losscut_pct: env_opt_f64("EDGEX_POSITION_LOSSCUT_PERCENTAGE")?,
            position_take_profit_pct: env_opt_f64("EDGEX_POSITION_TAKE_PROFIT_PERCENTAGE")?,
            asset_losscut_pct: env_opt_f64("EDGEX_ASSET_LOSSCUT_PERCENTAGE")?,
            asset_take_profit_pct: env_opt_f64("EDGEX_ASSET_TAKE_PROFIT_PERCENTAGE")?,
            balance_recovery_enabled: env_bool("EDGEX_BALANCE_RECOVERY_ENABLED", false),
            initial_balance_usd: env_opt_f64("EDGEX_INITIAL_BALANCE_USD")?,
            recovery_enforce_level_usd: env_opt_f64("EDGEX_RECOVERY_ENFORCE_LEVEL_USD")?,
            leverage: env_f64("EDGEX_LEVERAGE", 100.0)?,
            size_limit,
        };

        let out_of_schedule_action = match env_str("EDGEX_OUT_OF_SCHEDULE_ACTION").as_deref() {
            Some("nothing") => OutOfScheduleAction::Nothing,
            Some("immediately") => OutOfScheduleAction::Immediately,
            Some("auto") | None => OutOfScheduleAction::Auto,
            Some(other) => {
                return Err(ConfigError::InvalidValue(
                    "EDGEX_OUT_OF_SCHEDULE_ACTION".to_string(),
                    other.to_string(),
                ))
            }
        };

        let schedule = ScheduleConfig {
            enabled: env_bool("EDGEX_USE_SCHEDULE", false),
            schedule_type: env_str("EDGEX_USE_SCHEDULE_TYPE").unwrap_or_else(|| "normal".to_string()),
            out_of_schedule_action,
        };

        Ok(Config {
            base_url,
            account_id,
            stark_private_key,
            symbol,
            poll_interval_sec,
            grid,
            grid_mode,
            risk,
            schedule,
        })
    }
}
