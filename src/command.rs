//! Command encoding for the robot's two MQTT dialects.
//!
//! Named actions go to the `cmd` topic:
//! ```json
//! {"command": "start", "time": 1700000000, "initiator": "localApp"}
//! ```
//! Configuration changes are partial state documents on the `delta` topic:
//! ```json
//! {"state": {"utctime": 1700000000, "localtimeoffset": -300}}
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{Local, Utc};
use serde::Serialize;

use crate::error::{Result, RoombaError};
use crate::state::ScheduleView;

pub const CMD_TOPIC:   &str = "cmd";
pub const DELTA_TOPIC: &str = "delta";

const INITIATOR: &str = "localApp";
const DAYS: usize = 7;

// ── Actions ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Pause,
    Resume,
    Dock,
}

impl Command {
    pub fn name(self) -> &'static str {
        match self {
            Command::Start  => "start",
            Command::Stop   => "stop",
            Command::Pause  => "pause",
            Command::Resume => "resume",
            Command::Dock   => "dock",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Wi-Fi security ────────────────────────────────────────────────────────────

/// Security mode codes understood by the robot's `wlcfg.sec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WifiSecurity {
    None         = 0,
    WepOpen      = 1,
    WepShared    = 2,
    Wpa          = 3,
    Wpa2         = 4,
    WpaWpa2Mixed = 5,
    EapTls       = 6,
    Wildcard     = 7,
}

impl WifiSecurity {
    pub fn code(self) -> u8 { self as u8 }
}

impl FromStr for WifiSecurity {
    type Err = RoombaError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "none" | "open" | "0" => WifiSecurity::None,
            "wep-open" | "1"      => WifiSecurity::WepOpen,
            "wep-shared" | "2"    => WifiSecurity::WepShared,
            "wpa" | "3"           => WifiSecurity::Wpa,
            "wpa2" | "4"          => WifiSecurity::Wpa2,
            "wpa-wpa2" | "5"      => WifiSecurity::WpaWpa2Mixed,
            "eap-tls" | "6"       => WifiSecurity::EapTls,
            "wildcard" | "7"      => WifiSecurity::Wildcard,
            other => return Err(RoombaError::Argument(format!("unknown wifi security {other:?}"))),
        })
    }
}

// ── Weekly schedule ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanAction {
    Clean,
    None,
}

impl CleanAction {
    /// Wire name used in `cleanSchedule.cycle`.
    pub fn cycle_name(self) -> &'static str {
        match self {
            CleanAction::Clean => "start",
            CleanAction::None  => "none",
        }
    }
}

impl FromStr for CleanAction {
    type Err = RoombaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(CleanAction::Clean),
            "none"  => Ok(CleanAction::None),
            other   => Err(RoombaError::Argument(format!("unknown cycle {other:?}"))),
        }
    }
}

/// One day's slot of the weekly schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub action: CleanAction,
    pub hour:   u8,
    pub minute: u8,
}

impl ScheduleEntry {
    pub fn new(action: CleanAction, hour: u8, minute: u8) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(RoombaError::Argument(format!("invalid time {hour}:{minute:02}")));
        }
        Ok(Self { action, hour, minute })
    }
}

/// `<start|none>@HH:MM`, e.g. `start@09:30`.
impl FromStr for ScheduleEntry {
    type Err = RoombaError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || RoombaError::Argument(format!("schedule entry {s:?}, expected <start|none>@HH:MM"));
        let (action, time) = s.split_once('@').ok_or_else(bad)?;
        let (h, m) = time.split_once(':').ok_or_else(bad)?;
        let hour: u8 = h.trim().parse().map_err(|_| bad())?;
        let minute: u8 = m.trim().parse().map_err(|_| bad())?;
        ScheduleEntry::new(action.trim().parse()?, hour, minute)
    }
}

/// Seven schedule slots, Sunday first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklySchedule {
    days: [ScheduleEntry; DAYS],
}

impl WeeklySchedule {
    pub fn new(entries: &[ScheduleEntry]) -> Result<Self> {
        let days: [ScheduleEntry; DAYS] = entries.try_into().map_err(|_| {
            RoombaError::Argument(format!("schedule needs {DAYS} days, got {}", entries.len()))
        })?;
        Ok(Self { days })
    }

    /// Build from parallel arrays; `true` in `actions` means clean that day.
    pub fn from_arrays(actions: &[bool], hours: &[u8], minutes: &[u8]) -> Result<Self> {
        check_lengths(actions.len(), hours.len(), minutes.len())?;
        let entries = actions
            .iter()
            .zip(hours)
            .zip(minutes)
            .map(|((&on, &h), &m)| {
                let action = if on { CleanAction::Clean } else { CleanAction::None };
                ScheduleEntry::new(action, h, m)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(&entries)
    }

    /// Build from cycle names as the robot reports them (`"start"` / `"none"`).
    pub fn from_cycle_names(cycles: &[&str], hours: &[u8], minutes: &[u8]) -> Result<Self> {
        check_lengths(cycles.len(), hours.len(), minutes.len())?;
        let entries = cycles
            .iter()
            .zip(hours)
            .zip(minutes)
            .map(|((c, &h), &m)| ScheduleEntry::new(c.parse()?, h, m))
            .collect::<Result<Vec<_>>>()?;
        Self::new(&entries)
    }

    pub fn days(&self) -> &[ScheduleEntry; DAYS] { &self.days }
}

impl TryFrom<&ScheduleView> for WeeklySchedule {
    type Error = RoombaError;

    fn try_from(view: &ScheduleView) -> Result<Self> {
        let narrow = |v: &[i64]| -> Result<Vec<u8>> {
            v.iter()
                .map(|&x| u8::try_from(x).map_err(|_| RoombaError::Argument(format!("time value {x}"))))
                .collect()
        };
        let cycles: Vec<&str> = view.cycle.iter().map(String::as_str).collect();
        Self::from_cycle_names(&cycles, &narrow(&view.h)?, &narrow(&view.m)?)
    }
}

fn check_lengths(actions: usize, hours: usize, minutes: usize) -> Result<()> {
    if actions != DAYS || hours != DAYS || minutes != DAYS {
        return Err(RoombaError::Argument(format!(
            "schedule arrays must have {DAYS} entries (got {actions}/{hours}/{minutes})"
        )));
    }
    Ok(())
}

// ── Wire documents ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ActionDoc<'a> {
    command:   &'a str,
    time:      i64,
    initiator: &'a str,
}

#[derive(Serialize)]
struct DeltaDoc<T> {
    state: T,
}

#[derive(Serialize)]
struct ClockDelta {
    utctime:         i64,
    localtimeoffset: i32,
}

#[derive(Serialize)]
struct WifiDelta<'a> {
    wlcfg: WlCfg<'a>,
}

#[derive(Serialize)]
struct WlCfg<'a> {
    ssid: String,
    sec:  u8,
    pass: &'a str,
}

#[derive(Serialize)]
struct ScheduleDelta {
    #[serde(rename = "cleanSchedule")]
    clean_schedule: ScheduleArrays,
}

#[derive(Serialize)]
struct ScheduleArrays {
    cycle: [&'static str; DAYS],
    h:     [u8; DAYS],
    m:     [u8; DAYS],
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// An encoded command ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic:   &'static str,
    pub payload: String,
}

impl Envelope {
    /// Named action stamped with `time` (epoch seconds).
    pub fn action(cmd: Command, time: i64) -> Result<Self> {
        let doc = ActionDoc { command: cmd.name(), time, initiator: INITIATOR };
        Ok(Self { topic: CMD_TOPIC, payload: serde_json::to_string(&doc)? })
    }

    /// `offset` is local minus UTC, in minutes.
    pub fn set_time(utctime: i64, offset: i32) -> Result<Self> {
        delta(ClockDelta { utctime, localtimeoffset: offset })
    }

    pub fn set_wifi(ssid: &str, password: &str, sec: WifiSecurity) -> Result<Self> {
        delta(WifiDelta {
            wlcfg: WlCfg { ssid: hex_ssid(ssid), sec: sec.code(), pass: password },
        })
    }

    pub fn set_schedule(schedule: &WeeklySchedule) -> Result<Self> {
        let days = *schedule.days();
        delta(ScheduleDelta {
            clean_schedule: ScheduleArrays {
                cycle: days.map(|d| d.action.cycle_name()),
                h:     days.map(|d| d.hour),
                m:     days.map(|d| d.minute),
            },
        })
    }
}

fn delta<T: Serialize>(state: T) -> Result<Envelope> {
    Ok(Envelope { topic: DELTA_TOPIC, payload: serde_json::to_string(&DeltaDoc { state })? })
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Uppercase hex of the SSID's UTF-8 bytes: "AB" → "4142".
pub fn hex_ssid(ssid: &str) -> String {
    ssid.bytes().map(|b| format!("{b:02X}")).collect()
}

/// Whole seconds since the Unix epoch.
pub fn epoch_secs() -> i64 {
    Utc::now().timestamp()
}

/// Local minus UTC in whole minutes, rounded half-up.
pub fn local_offset_minutes() -> i32 {
    offset_minutes(Local::now().offset().local_minus_utc())
}

fn offset_minutes(secs: i32) -> i32 {
    (secs + 30).div_euclid(60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn parsed(env: &Envelope) -> Value {
        serde_json::from_str(&env.payload).unwrap()
    }

    #[test]
    fn start_is_stamped_now() {
        let before = epoch_secs();
        let env = Envelope::action(Command::Start, epoch_secs()).unwrap();
        let after = epoch_secs();
        assert_eq!(env.topic, CMD_TOPIC);
        let v = parsed(&env);
        assert_eq!(v["command"], "start");
        assert_eq!(v["initiator"], "localApp");
        let t = v["time"].as_i64().unwrap();
        assert!(t >= before && t <= after);
    }

    #[test]
    fn action_field_order() {
        let env = Envelope::action(Command::Dock, 42).unwrap();
        assert_eq!(env.payload, r#"{"command":"dock","time":42,"initiator":"localApp"}"#);
    }

    #[test]
    fn set_time_document() {
        let env = Envelope::set_time(1_700_000_000, -300).unwrap();
        assert_eq!(env.topic, DELTA_TOPIC);
        assert_eq!(parsed(&env), json!({"state": {"utctime": 1700000000, "localtimeoffset": -300}}));
    }

    #[test]
    fn wifi_ssid_is_hex() {
        assert_eq!(hex_ssid("AB"), "4142");
        assert_eq!(hex_ssid("é"), "C3A9");
        let env = Envelope::set_wifi("AB", "p@ss \"x\"", WifiSecurity::Wpa2).unwrap();
        assert_eq!(
            parsed(&env),
            json!({"state": {"wlcfg": {"ssid": "4142", "sec": 4, "pass": "p@ss \"x\""}}})
        );
    }

    #[test]
    fn schedule_arrays_are_aligned() {
        let actions = [false, true, true, false, true, true, false];
        let hours = [0, 9, 10, 11, 12, 13, 23];
        let minutes = [0, 30, 0, 15, 45, 5, 59];
        let schedule = WeeklySchedule::from_arrays(&actions, &hours, &minutes).unwrap();
        let v = parsed(&Envelope::set_schedule(&schedule).unwrap());
        let cs = &v["state"]["cleanSchedule"];
        for i in 0..7 {
            assert_eq!(cs["cycle"][i] == "start", actions[i], "day {i}");
            assert_eq!(cs["h"][i], hours[i] as i64);
            assert_eq!(cs["m"][i], minutes[i] as i64);
        }
    }

    #[test]
    fn schedule_rejects_wrong_lengths() {
        let seven = [9u8; 7];
        let six = [9u8; 6];
        assert!(matches!(
            WeeklySchedule::from_arrays(&[true; 6], &seven, &seven),
            Err(RoombaError::Argument(_))
        ));
        assert!(matches!(
            WeeklySchedule::from_arrays(&[true; 7], &six, &seven),
            Err(RoombaError::Argument(_))
        ));
        assert!(matches!(
            WeeklySchedule::from_arrays(&[true; 7], &seven, &[0u8; 8]),
            Err(RoombaError::Argument(_))
        ));
    }

    #[test]
    fn schedule_rejects_out_of_range_time() {
        let err = WeeklySchedule::from_arrays(&[true; 7], &[24; 7], &[0; 7]).unwrap_err();
        assert!(matches!(err, RoombaError::Argument(_)));
    }

    #[test]
    fn schedule_from_cycle_names() {
        let cycles = ["none", "start", "start", "start", "start", "start", "none"];
        let s = WeeklySchedule::from_cycle_names(&cycles, &[9; 7], &[0; 7]).unwrap();
        assert_eq!(s.days()[0].action, CleanAction::None);
        assert_eq!(s.days()[1].action, CleanAction::Clean);
        assert!(WeeklySchedule::from_cycle_names(&["later"; 7], &[9; 7], &[0; 7]).is_err());
    }

    #[test]
    fn schedule_entry_from_str() {
        let e: ScheduleEntry = "start@09:30".parse().unwrap();
        assert_eq!(e, ScheduleEntry { action: CleanAction::Clean, hour: 9, minute: 30 });
        assert!("start@25:00".parse::<ScheduleEntry>().is_err());
        assert!("clean".parse::<ScheduleEntry>().is_err());
    }

    #[test]
    fn offset_rounds_half_up() {
        assert_eq!(offset_minutes(-18_000), -300);
        assert_eq!(offset_minutes(3_600), 60);
        assert_eq!(offset_minutes(29), 0);
        assert_eq!(offset_minutes(30), 1);
        assert_eq!(offset_minutes(-30), 0);
        assert_eq!(offset_minutes(-31), -1);
        assert_eq!(offset_minutes(19_800), 330);
    }

    #[test]
    fn wifi_security_codes() {
        assert_eq!("wpa2".parse::<WifiSecurity>().unwrap().code(), 4);
        assert_eq!("7".parse::<WifiSecurity>().unwrap(), WifiSecurity::Wildcard);
        assert!("wpa4".parse::<WifiSecurity>().is_err());
    }
}
