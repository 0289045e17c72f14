//! TOML config file loading and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration as StdDuration;
use time::{Duration, UtcOffset};

use crate::actuator::Limits;
use crate::controller::Settings;
use crate::modem::ModemTimeouts;
use crate::mqtt::ScheduleMsg;
use crate::notify::RetryPolicy;
use crate::schedule::Schedule;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub plant_id: String,
    #[serde(default = "default_utc_offset")]
    pub utc_offset_hours: i8,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub relays: RelayConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub intervals: IntervalConfig,
    /// Used until the first list arrives from the broker.
    #[serde(default)]
    pub schedules: Vec<ScheduleMsg>,
}

fn default_utc_offset() -> i8 {
    8
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub tick_ms: u64,
    pub disconnect_ceiling: u8,
    pub default_threshold: u8,
    pub fallback_water_sec: u64,
    pub fallback_fertilizer_sec: u64,
    pub stale_reading_sec: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            disconnect_ceiling: 95,
            default_threshold: 60,
            fallback_water_sec: 30,
            fallback_fertilizer_sec: 50,
            stale_reading_sec: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub recipients: Vec<String>,
    pub max_attempts: u32,
    pub retry_interval_sec: u64,
    pub prefix: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            recipients: Vec::new(),
            max_attempts: 3,
            retry_interval_sec: 10,
            prefix: "Smart Plant System".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub recovery_interval_sec: u64,
    pub device: String,
    pub baud: u32,
    pub command_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub registration_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recovery_interval_sec: 60,
            device: "/dev/serial0".to_string(),
            baud: 9600,
            command_timeout_ms: 5000,
            send_timeout_ms: 10000,
            registration_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub water_pin: u8,
    pub fertilizer_pin: u8,
    pub active_low: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            water_pin: 26,
            fertilizer_pin: 23,
            active_low: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    pub telemetry_sec: u64,
    pub schedule_poll_sec: u64,
    pub diagnostics_sec: u64,
    /// Local history older than this is pruned.
    pub history_days: u32,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            telemetry_sec: 25,
            schedule_poll_sec: 30,
            diagnostics_sec: 3600,
            history_days: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM, 14-15 carry the modem UART.
/// A tick must finish inside one wall-clock minute.
const TICK_BUDGET: StdDuration = StdDuration::from_secs(60);

const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_identity(&mut errors);
        self.validate_control(&mut errors);
        self.validate_notify(&mut errors);
        self.validate_transport(&mut errors);
        self.validate_tick_budget(&mut errors);
        self.validate_relays(&mut errors);
        self.validate_network(&mut errors);
        self.validate_schedules(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_identity(&self, errors: &mut Vec<String>) {
        if self.plant_id.trim().is_empty() {
            errors.push("plant_id is empty".to_string());
        } else if self.plant_id.contains(['/', '+', '#']) {
            errors.push(format!(
                "plant_id '{}' must not contain MQTT topic characters (/ + #)",
                self.plant_id
            ));
        }

        if !(-12..=14).contains(&self.utc_offset_hours) {
            errors.push(format!(
                "utc_offset_hours {} out of range [-12, 14]",
                self.utc_offset_hours
            ));
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        let c = &self.control;

        // A tick per minute at least, or a schedule minute could be skipped.
        if c.tick_ms == 0 || c.tick_ms >= 60_000 {
            errors.push(format!("control.tick_ms {} must be in [1, 59999]", c.tick_ms));
        }
        if c.disconnect_ceiling == 0 || c.disconnect_ceiling > 100 {
            errors.push(format!(
                "control.disconnect_ceiling {} out of range [1, 100]",
                c.disconnect_ceiling
            ));
        }
        if c.default_threshold >= c.disconnect_ceiling {
            errors.push(format!(
                "control.default_threshold ({}) must be below disconnect_ceiling ({})",
                c.default_threshold, c.disconnect_ceiling
            ));
        }
        for (name, v) in [
            ("fallback_water_sec", c.fallback_water_sec),
            ("fallback_fertilizer_sec", c.fallback_fertilizer_sec),
            ("stale_reading_sec", c.stale_reading_sec),
        ] {
            if v == 0 {
                errors.push(format!("control.{name} must be positive"));
            }
        }
    }

    fn validate_notify(&self, errors: &mut Vec<String>) {
        let n = &self.notify;

        if n.recipients.is_empty() {
            errors.push("notify.recipients is empty".to_string());
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for r in &n.recipients {
            let digits = r.strip_prefix('+').unwrap_or("");
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                errors.push(format!(
                    "notify.recipients: '{r}' is not an international number (+digits)"
                ));
            } else if !seen.insert(r) {
                errors.push(format!("notify.recipients: duplicate '{r}'"));
            }
        }

        if n.max_attempts == 0 {
            errors.push("notify.max_attempts must be at least 1".to_string());
        }
        if n.retry_interval_sec == 0 {
            errors.push("notify.retry_interval_sec must be positive".to_string());
        }
    }

    fn validate_transport(&self, errors: &mut Vec<String>) {
        let t = &self.transport;

        if t.device.trim().is_empty() {
            errors.push("transport.device is empty".to_string());
        }
        for (name, v) in [
            ("recovery_interval_sec", t.recovery_interval_sec),
            ("baud", u64::from(t.baud)),
            ("command_timeout_ms", t.command_timeout_ms),
            ("send_timeout_ms", t.send_timeout_ms),
            ("registration_attempts", u64::from(t.registration_attempts)),
        ] {
            if v == 0 {
                errors.push(format!("transport.{name} must be positive"));
            }
        }
    }

    /// A tick runs at most one blocking transport phase (a recovery handshake
    /// or one notification attempt across every recipient). The slower of the
    /// two plus the tick period must leave every minute evaluated.
    fn validate_tick_budget(&self, errors: &mut Vec<String>) {
        let t = ModemTimeouts::from(&self.transport);
        let recipients = u32::try_from(self.notify.recipients.len()).unwrap_or(u32::MAX);
        let handshake = t.worst_case_handshake();
        let drain = t.worst_case_send().saturating_mul(recipients);
        let worst = handshake
            .max(drain)
            .saturating_add(StdDuration::from_millis(self.control.tick_ms));

        if worst >= TICK_BUDGET {
            errors.push(format!(
                "transport: a tick can block for {}s (handshake {}s, {} recipient(s) {}s, tick {} ms); \
                 must stay under {}s",
                worst.as_secs(),
                handshake.as_secs(),
                recipients,
                drain.as_secs(),
                self.control.tick_ms,
                TICK_BUDGET.as_secs()
            ));
        }
    }

    fn validate_relays(&self, errors: &mut Vec<String>) {
        let r = &self.relays;
        for (name, pin) in [("water_pin", r.water_pin), ("fertilizer_pin", r.fertilizer_pin)] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "relays.{name} {pin} is not a usable BCM GPIO pin"
                ));
            }
        }
        if r.water_pin == r.fertilizer_pin {
            errors.push(format!(
                "relays: water_pin and fertilizer_pin are both {}",
                r.water_pin
            ));
        }
    }

    fn validate_network(&self, errors: &mut Vec<String>) {
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if self.mqtt.port == 0 {
            errors.push("mqtt.port must be positive".to_string());
        }
        if self.web.port == 0 {
            errors.push("web.port must be positive".to_string());
        }

        let i = &self.intervals;
        for (name, v) in [
            ("telemetry_sec", i.telemetry_sec),
            ("schedule_poll_sec", i.schedule_poll_sec),
            ("diagnostics_sec", i.diagnostics_sec),
            ("history_days", u64::from(i.history_days)),
        ] {
            if v == 0 {
                errors.push(format!("intervals.{name} must be positive"));
            }
        }
    }

    fn validate_schedules(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, s) in self.schedules.iter().enumerate() {
            if let Err(e) = s.to_schedule() {
                errors.push(format!("schedules[{i}]: {e}"));
            } else if !seen.insert(s.id.trim()) {
                errors.push(format!("schedules[{i}]: duplicate _id '{}'", s.id));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Derived values
    // -----------------------------------------------------------------------

    pub fn utc_offset(&self) -> UtcOffset {
        UtcOffset::from_hms(self.utc_offset_hours, 0, 0).unwrap_or(UtcOffset::UTC)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::seconds(self.control.stale_reading_sec as i64)
    }

    pub fn controller_settings(&self) -> Settings {
        let c = &self.control;
        Settings {
            limits: Limits {
                disconnect_ceiling: c.disconnect_ceiling,
                default_threshold: c.default_threshold,
                fallback_water: Duration::seconds(c.fallback_water_sec as i64),
                fallback_fertilizer: Duration::seconds(c.fallback_fertilizer_sec as i64),
            },
            retry: RetryPolicy {
                max_attempts: self.notify.max_attempts,
                retry_interval: Duration::seconds(self.notify.retry_interval_sec as i64),
            },
            message_prefix: self.notify.prefix.clone(),
            recovery_interval: Duration::seconds(self.transport.recovery_interval_sec as i64),
            recipients: self.notify.recipients.clone(),
        }
    }

    /// Seed schedules; entries are checked by `validate`.
    pub fn seed_schedules(&self) -> Vec<Schedule> {
        self.schedules
            .iter()
            .filter_map(|s| s.to_schedule().ok())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{Recurrence, ScheduleKind, WateringMode};

    const MINIMAL: &str = r#"
plant_id = "basil"

[notify]
recipients = ["+639171234567"]
"#;

    fn valid_config() -> Config {
        toml::from_str(MINIMAL).unwrap()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse(MINIMAL).unwrap();
        assert_eq!(cfg.plant_id, "basil");
        assert_eq!(cfg.utc_offset_hours, 8);
        assert_eq!(cfg.control.tick_ms, 1000);
        assert_eq!(cfg.control.disconnect_ceiling, 95);
        assert_eq!(cfg.control.default_threshold, 60);
        assert_eq!(cfg.notify.max_attempts, 3);
        assert_eq!(cfg.notify.retry_interval_sec, 10);
        assert_eq!(cfg.notify.prefix, "Smart Plant System");
        assert_eq!(cfg.transport.recovery_interval_sec, 60);
        assert_eq!(cfg.transport.baud, 9600);
        assert_eq!(cfg.relays.water_pin, 26);
        assert_eq!(cfg.relays.fertilizer_pin, 23);
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.web.port, 8080);
        assert_eq!(cfg.intervals.schedule_poll_sec, 30);
        assert!(cfg.schedules.is_empty());
    }

    #[test]
    fn missing_plant_id_fails_to_parse() {
        assert!(parse("[notify]\nrecipients = [\"+1\"]\n").is_err());
    }

    #[test]
    fn full_config_with_seed_schedules() {
        let toml_str = r#"
plant_id = "tomato"
utc_offset_hours = -5

[control]
tick_ms = 500
fallback_water_sec = 45

[notify]
recipients = ["+15550001", "+15550002"]
max_attempts = 5

[relays]
water_pin = 17
fertilizer_pin = 27
active_low = true

[[schedules]]
_id = "w1"
type = "watering"
time = "08:00"
duration = 10
enabled = true
days = ["Monday", "Thursday"]
settings = { moistureThreshold = 55, moistureMode = "auto" }

[[schedules]]
_id = "f1"
type = "fertilizing"
time = "09:30"
duration = 5
enabled = true
calendarDays = [1, 15]
"#;
        let cfg = parse(toml_str).unwrap();
        assert_eq!(cfg.control.tick_ms, 500);
        assert_eq!(cfg.control.stale_reading_sec, 120);
        assert!(cfg.relays.active_low);

        let seeds = cfg.seed_schedules();
        assert_eq!(seeds.len(), 2);
        assert_eq!(
            seeds[0].kind,
            ScheduleKind::Watering {
                moisture_threshold: 55,
                mode: WateringMode::Auto
            }
        );
        assert!(matches!(seeds[1].recurrence, Recurrence::Monthly { .. }));

        let settings = cfg.controller_settings();
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.limits.fallback_water, Duration::seconds(45));
        assert_eq!(settings.recipients.len(), 2);
        assert_eq!(cfg.utc_offset().whole_hours(), -5);
    }

    // -- Validation: valid configs pass -----------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    // -- Identity ---------------------------------------------------------

    #[test]
    fn empty_plant_id_rejected() {
        let mut cfg = valid_config();
        cfg.plant_id = " ".into();
        assert_validation_err(&cfg, "plant_id is empty");
    }

    #[test]
    fn plant_id_with_topic_chars_rejected() {
        let mut cfg = valid_config();
        cfg.plant_id = "a/b".into();
        assert_validation_err(&cfg, "MQTT topic characters");
    }

    #[test]
    fn utc_offset_out_of_range() {
        let mut cfg = valid_config();
        cfg.utc_offset_hours = 15;
        assert_validation_err(&cfg, "utc_offset_hours 15");
    }

    // -- Control ----------------------------------------------------------

    #[test]
    fn tick_must_be_sub_minute() {
        let mut cfg = valid_config();
        cfg.control.tick_ms = 60_000;
        assert_validation_err(&cfg, "control.tick_ms");
        cfg.control.tick_ms = 0;
        assert_validation_err(&cfg, "control.tick_ms");
    }

    #[test]
    fn threshold_must_be_below_ceiling() {
        let mut cfg = valid_config();
        cfg.control.default_threshold = 95;
        assert_validation_err(&cfg, "must be below disconnect_ceiling");
    }

    #[test]
    fn zero_fallback_rejected() {
        let mut cfg = valid_config();
        cfg.control.fallback_fertilizer_sec = 0;
        assert_validation_err(&cfg, "fallback_fertilizer_sec must be positive");
    }

    // -- Notify -----------------------------------------------------------

    #[test]
    fn no_recipients_rejected() {
        let mut cfg = valid_config();
        cfg.notify.recipients.clear();
        assert_validation_err(&cfg, "notify.recipients is empty");
    }

    #[test]
    fn malformed_recipient_rejected() {
        let mut cfg = valid_config();
        cfg.notify.recipients = vec!["09171234567".into(), "+".into(), "+63 917".into()];
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "{msg}");
    }

    #[test]
    fn duplicate_recipient_rejected() {
        let mut cfg = valid_config();
        cfg.notify.recipients.push("+639171234567".into());
        assert_validation_err(&cfg, "duplicate '+639171234567'");
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut cfg = valid_config();
        cfg.notify.max_attempts = 0;
        assert_validation_err(&cfg, "max_attempts must be at least 1");
    }

    // -- Transport --------------------------------------------------------

    #[test]
    fn transport_zero_values_rejected() {
        let mut cfg = valid_config();
        cfg.transport.baud = 0;
        cfg.transport.registration_attempts = 0;
        assert_validation_err(&cfg, "transport.baud must be positive");
        assert_validation_err(&cfg, "transport.registration_attempts must be positive");
    }

    #[test]
    fn transport_timeouts_bounded() {
        let mut cfg = valid_config();
        cfg.transport.send_timeout_ms = 120_000;
        assert_validation_err(&cfg, "a tick can block");
    }

    #[test]
    fn slow_handshake_exceeds_tick_budget() {
        let mut cfg = valid_config();
        cfg.transport.command_timeout_ms = 30_000;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("handshake 249s"), "{msg}");
    }

    #[test]
    fn recipients_count_toward_tick_budget() {
        let mut cfg = valid_config();
        cfg.notify.recipients = (1..=4).map(|i| format!("+6391700000{i}")).collect();
        // 4 x 12 s plus the 1 s tick still fits.
        assert!(cfg.validate().is_ok());

        cfg.notify.recipients.push("+63917000005".into());
        assert_validation_err(&cfg, "5 recipient(s) 60s");
    }

    #[test]
    fn long_timeouts_with_many_recipients_rejected() {
        let mut cfg = valid_config();
        cfg.transport.command_timeout_ms = 30_000;
        cfg.transport.send_timeout_ms = 60_000;
        cfg.notify.recipients = (1..=5).map(|i| format!("+6391700000{i}")).collect();
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("a tick can block for 311s"), "{msg}");
    }

    #[test]
    fn default_transport_fits_tick_budget_with_two_recipients() {
        let mut cfg = valid_config();
        cfg.notify.recipients = vec!["+639171234567".into(), "+639171234568".into()];
        assert!(cfg.validate().is_ok());
    }

    // -- Relays -----------------------------------------------------------

    #[test]
    fn relay_reserved_pins_rejected() {
        for pin in [0, 1, 14, 15, 28] {
            let mut cfg = valid_config();
            cfg.relays.water_pin = pin;
            assert_validation_err(&cfg, "is not a usable BCM GPIO pin");
        }
    }

    #[test]
    fn relay_pins_must_differ() {
        let mut cfg = valid_config();
        cfg.relays.fertilizer_pin = cfg.relays.water_pin;
        assert_validation_err(&cfg, "are both 26");
    }

    // -- Network / intervals ----------------------------------------------

    #[test]
    fn zero_interval_rejected() {
        let mut cfg = valid_config();
        cfg.intervals.telemetry_sec = 0;
        assert_validation_err(&cfg, "intervals.telemetry_sec must be positive");
    }

    #[test]
    fn empty_mqtt_host_rejected() {
        let mut cfg = valid_config();
        cfg.mqtt.host = "".into();
        assert_validation_err(&cfg, "mqtt.host is empty");
    }

    // -- Seed schedules ---------------------------------------------------

    #[test]
    fn bad_seed_schedule_rejected() {
        let toml_str = format!(
            "{MINIMAL}\n[[schedules]]\n_id = \"x\"\ntype = \"misting\"\ntime = \"08:00\"\n"
        );
        let err = parse(&toml_str).unwrap_err();
        assert!(format!("{err:#}").contains("schedules[0]"), "{err:#}");
    }

    #[test]
    fn duplicate_seed_ids_rejected() {
        let entry = "\n[[schedules]]\n_id = \"w\"\ntype = \"watering\"\ntime = \"08:00\"\n";
        let toml_str = format!("{MINIMAL}{entry}{entry}");
        let err = parse(&toml_str).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate _id 'w'"), "{err:#}");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.plant_id = "".into();
        cfg.notify.recipients.clear();
        cfg.relays.water_pin = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("plant_id is empty"), "{msg}");
        assert!(msg.contains("recipients is empty"), "{msg}");
        assert!(msg.contains("water_pin 0"), "{msg}");
    }

    // -- Shipped sample -----------------------------------------------------

    #[test]
    fn shipped_config_is_valid() {
        let cfg = parse(include_str!("../config.toml")).unwrap();
        assert_eq!(cfg.plant_id, "balcony-basil");
        let seeds = cfg.seed_schedules();
        assert_eq!(seeds.len(), 2);
        assert!(seeds[0].is_auto_watering());
        assert_eq!(seeds[0].moisture_threshold(), Some(60));
    }
}
