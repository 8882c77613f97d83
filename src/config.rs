/// Driver policy knobs, fixed at construction.
///
/// These replace boot-time flags: the orchestrator receives one explicit
/// record instead of reading global state.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Never request 1.8V signaling, which keeps the card out of UHS-I.
    pub force_330v: bool,
    /// Skip speed negotiation entirely and stay at Default Speed.
    pub force_default_speed: bool,
    /// Cap negotiation at High Speed even when UHS-I is available.
    pub force_high_speed: bool,
    /// Do not pre-declare erase counts (ACMD23) before multi-block writes.
    pub disable_pre_erase: bool,
    /// Issue every transaction as single-block commands.
    pub split_multiblock: bool,
    /// Round-trips allowed for one application command before giving up.
    pub app_cmd_retries: u32,
    pub simple_pool_capacity: usize,
    pub complex_pool_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            force_330v: false,
            force_default_speed: false,
            force_high_speed: false,
            disable_pre_erase: false,
            split_multiblock: false,
            app_cmd_retries: 2,
            simple_pool_capacity: 32,
            complex_pool_capacity: 32,
        }
    }
}
