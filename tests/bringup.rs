//! Bring-up and speed-negotiation ladder, driven through the public
//! driver API against the scripted host.

mod common;

use common::{attach_driver, CardModel, MockHost};
use sdhost::sd::constant::*;
use sdhost::{DriverConfig, HostCaps, PowerMode, SignalVoltage, TimingMode};

fn cmd0_count(host: &MockHost) -> usize {
    host.calls().iter().filter(|c| c.opcode == SD_GO_IDLE_STATE).count()
}

#[test]
fn uhs_card_negotiates_sdr104() {
    let host = MockHost::new(Some(CardModel::uhs()));
    let probe = host.clone();
    let driver = attach_driver(host, DriverConfig::default());

    assert!(driver.is_present());
    let bus = probe.last_bus_config();
    assert_eq!(bus.timing, TimingMode::UhsSdr104);
    assert_eq!(bus.clock, SD_CLOCK_SDR104);
    assert_eq!(bus.signal_voltage, SignalVoltage::Voltage180);
    assert_eq!(probe.tuning_runs(), 1);

    let calls = probe.calls();
    assert!(calls.iter().any(|c| c.opcode == SD_VOLTAGE_SWITCH));
    assert!(calls.iter().any(|c| c.opcode == SD_APP_SET_BUS_WIDTH && c.app));

    // Current limit (group 3, 800 mA) is negotiated before the access mode
    let limit_at = calls
        .iter()
        .position(|c| c.opcode == SD_SWITCH_FUNC && !c.app && c.arg == 0x80FF_3FFF)
        .expect("current-limit switch missing");
    let mode_at = calls
        .iter()
        .position(|c| c.opcode == SD_SWITCH_FUNC && !c.app && c.arg == 0x80FF_FFF3)
        .expect("access-mode switch missing");
    assert!(limit_at < mode_at);
}

#[test]
fn voltage_switch_failure_falls_back_to_high_speed() {
    let host = MockHost::new(Some(CardModel::uhs()));
    host.state.lock().unwrap().fail_signal_switch = true;
    let probe = host.clone();
    let driver = attach_driver(host, DriverConfig::default());

    assert!(driver.is_present());
    let bus = probe.last_bus_config();
    assert_eq!(bus.timing, TimingMode::SdHighSpeed);
    assert_eq!(bus.clock, SD_CLOCK_HIGH_SPEED);
    assert_eq!(bus.signal_voltage, SignalVoltage::Voltage330);
    assert_eq!(probe.tuning_runs(), 0);
    // One UHS attempt, one high-speed attempt, no third
    assert_eq!(cmd0_count(&probe), 2);
    assert_eq!(
        probe.calls().iter().filter(|c| c.opcode == SD_VOLTAGE_SWITCH).count(),
        1
    );
}

#[test]
fn tuning_failure_steps_down_from_sdr104() {
    let host = MockHost::new(Some(CardModel::uhs()));
    host.state.lock().unwrap().tuning_result = Err(sdhost::SdError::Timeout);
    let probe = host.clone();
    let driver = attach_driver(host, DriverConfig::default());

    assert!(driver.is_present());
    assert_eq!(probe.last_bus_config().timing, TimingMode::SdHighSpeed);
    assert_eq!(probe.tuning_runs(), 1);
    assert_eq!(cmd0_count(&probe), 2);
}

#[test]
fn tuning_failure_is_tolerated_on_ddr50() {
    let host = MockHost::new(Some(CardModel::uhs()));
    {
        let mut st = host.state.lock().unwrap();
        st.caps = HostCaps::BUS_WIDTH_4 | HostCaps::HIGH_SPEED | HostCaps::UHS_DDR50;
        st.tuning_result = Err(sdhost::SdError::Timeout);
    }
    let probe = host.clone();
    let driver = attach_driver(host, DriverConfig::default());

    assert!(driver.is_present());
    let bus = probe.last_bus_config();
    assert_eq!(bus.timing, TimingMode::UhsDdr50);
    assert_eq!(bus.clock, SD_CLOCK_DDR50);
    assert_eq!(probe.tuning_runs(), 1);
    assert_eq!(cmd0_count(&probe), 1);
}

#[test]
fn high_speed_echo_mismatch_falls_back_to_default() {
    let host = MockHost::new(Some(CardModel::high_speed()));
    host.state.lock().unwrap().cmd6_group0_echo = Some(SD_ACCESS_MODE_DEFAULT);
    let probe = host.clone();
    let driver = attach_driver(host, DriverConfig::default());

    // Falls back rather than failing outright
    assert!(driver.is_present());
    let bus = probe.last_bus_config();
    assert_eq!(bus.timing, TimingMode::Legacy);
    assert_eq!(bus.clock, 25_000_000);
}

#[test]
fn plain_high_speed_card_skips_uhs() {
    let host = MockHost::new(Some(CardModel::high_speed()));
    let probe = host.clone();
    let driver = attach_driver(host, DriverConfig::default());

    assert!(driver.is_present());
    let bus = probe.last_bus_config();
    assert_eq!(bus.timing, TimingMode::SdHighSpeed);
    assert_eq!(bus.signal_voltage, SignalVoltage::Voltage330);
    // The 3.3V card never sees a voltage-switch command
    assert!(!probe.calls().iter().any(|c| c.opcode == SD_VOLTAGE_SWITCH));
    assert_eq!(cmd0_count(&probe), 1);
}

#[test]
fn spec_1_0_card_never_sees_the_switch_function() {
    let host = MockHost::new(Some(CardModel::legacy()));
    let probe = host.clone();
    let driver = attach_driver(host, DriverConfig::default());

    assert!(driver.is_present());
    assert_eq!(probe.last_bus_config().timing, TimingMode::Legacy);
    assert!(!probe.calls().iter().any(|c| c.opcode == SD_SWITCH_FUNC && !c.app));
}

#[test]
fn forced_default_speed_skips_negotiation() {
    let host = MockHost::new(Some(CardModel::uhs()));
    let probe = host.clone();
    let config = DriverConfig {
        force_default_speed: true,
        ..DriverConfig::default()
    };
    let driver = attach_driver(host, config);

    assert!(driver.is_present());
    let bus = probe.last_bus_config();
    assert_eq!(bus.timing, TimingMode::Legacy);
    assert_eq!(bus.clock, 25_000_000);
    // No mode-set switch was ever issued
    assert!(!probe
        .calls()
        .iter()
        .any(|c| c.opcode == SD_SWITCH_FUNC && !c.app && c.arg & SD_SWITCH_MODE_SET != 0));
}

#[test]
fn acmd41_times_out_after_exactly_100_attempts() {
    let host = MockHost::new(Some(CardModel::uhs()));
    {
        let mut st = host.state.lock().unwrap();
        st.acmd41_busy_forever = true;
        // Confine the attach to the 400 kHz entry so attempts are countable
        st.clock_range.min_hz = 350_000;
    }
    let probe = host.clone();
    let driver = attach_driver(host, DriverConfig::default());

    assert!(!driver.is_present());
    let polls = probe
        .calls()
        .iter()
        .filter(|c| c.opcode == SD_APP_SEND_OP_COND && c.app && c.arg != 0)
        .count();
    assert_eq!(polls, 100);
    // 20 ms of backoff per miss
    assert!(probe.state.lock().unwrap().delays_ms >= 100 * 20);
    assert_eq!(probe.last_bus_config().power_mode, PowerMode::Off);
}

#[test]
fn no_common_voltage_window_aborts_attach() {
    let mut card = CardModel::uhs();
    card.ocr_voltage = 0x0000_8000; // 2.7-2.8V only
    let host = MockHost::new(Some(card));
    host.state.lock().unwrap().voltage_window = 0x00FF_0000; // 2.8V and up
    let probe = host.clone();
    let driver = attach_driver(host, DriverConfig::default());

    assert!(!driver.is_present());
    // Identification never started and the bus ended powered off
    assert!(!probe.calls().iter().any(|c| c.opcode == SD_ALL_SEND_CID));
    assert_eq!(probe.last_bus_config().power_mode, PowerMode::Off);
    assert!(driver.capacity_blocks().is_err());
}

#[test]
fn full_power_cycle_narrows_to_lowest_window() {
    let host = MockHost::new(Some(CardModel::uhs()));
    host.state.lock().unwrap().caps |= HostCaps::FULL_POWER_CYCLE;
    let probe = host.clone();
    let driver = attach_driver(host, DriverConfig::default());

    assert!(driver.is_present());
    let configs = probe.bus_configs();
    // Initial power-up rides the highest window bit, the restart the lowest
    let first_on = configs.iter().position(|c| c.power_mode == PowerMode::On).unwrap();
    assert_eq!(configs[first_on].voltage_bit, 23);
    let restart = configs
        .iter()
        .skip(first_on + 1)
        .skip_while(|c| c.power_mode == PowerMode::On)
        .find(|c| c.power_mode == PowerMode::On)
        .expect("no power restart");
    assert_eq!(restart.voltage_bit, 15);
}
