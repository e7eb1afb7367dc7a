//! Telemetry decoding.
//!
//! The robot publishes fragments of its shadow document
//! `{"state": {"reported": {...}}}`; each message carries only the fields
//! that changed.  Decoding is permissive: every field is optional, unknown
//! fields are ignored and names match regardless of case (the firmware is
//! not consistent, e.g. `nMBStll` vs `nMBStall`).
//!
//! Case-insensitivity is achieved by lower-casing every object key before
//! handing the document to serde, so all serde names below are lowercase.

use std::collections::HashMap;

use log::debug;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Result, RoombaError};

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// Decoded state report.  Fields the message did not carry are `None`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceStateSnapshot {
    pub state: Option<ShadowState>,
}

impl DeviceStateSnapshot {
    /// The `state.reported` section, if present.
    pub fn reported(&self) -> Option<&ReportedState> {
        self.state.as_ref()?.reported.as_ref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ShadowState {
    pub reported: Option<ReportedState>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReportedState {
    pub netinfo:  Option<NetInfo>,
    pub wifistat: Option<WifiStat>,
    pub wlcfg:    Option<WlCfg>,
    pub mac:      Option<String>,
    pub country:  Option<String>,
    #[serde(rename = "cloudenv")]
    pub cloud_env: Option<String>,
    #[serde(rename = "svcendpoints")]
    pub svc_endpoints: Option<SvcEndpoints>,
    #[serde(rename = "mapuploadallowed")]
    pub map_upload_allowed: Option<bool>,
    pub localtimeoffset: Option<i64>,
    pub utctime:  Option<i64>,
    pub pose:     Option<Pose>,
    #[serde(rename = "batpct")]
    pub bat_pct:  Option<i64>,
    pub dock:     Option<Dock>,
    pub bin:      Option<Bin>,
    pub audio:    Option<Audio>,
    #[serde(rename = "cleanmissionstatus")]
    pub clean_mission_status: Option<CleanMissionStatus>,
    pub language: Option<i64>,
    #[serde(rename = "noautopasses")]
    pub no_auto_passes: Option<bool>,
    #[serde(rename = "nopp")]
    pub no_pp:        Option<bool>,
    #[serde(rename = "ecocharge")]
    pub eco_charge:   Option<bool>,
    #[serde(rename = "vachigh")]
    pub vac_high:     Option<bool>,
    #[serde(rename = "binpause")]
    pub bin_pause:    Option<bool>,
    #[serde(rename = "carpetboost")]
    pub carpet_boost: Option<bool>,
    #[serde(rename = "openonly")]
    pub open_only:    Option<bool>,
    #[serde(rename = "twopass")]
    pub two_pass:     Option<bool>,
    #[serde(rename = "schedhold")]
    pub sched_hold:   Option<bool>,
    #[serde(rename = "lastcommand")]
    pub last_command: Option<LastCommand>,
    /// Supported languages as `{tag: code}` pairs (tags lower-cased).
    pub langs:     Option<Vec<HashMap<String, i64>>>,
    pub bbnav:     Option<BbNav>,
    pub bbpanic:   Option<BbPanic>,
    pub bbmssn:    Option<BbMssn>,
    pub bbrstinfo: Option<BbRstInfo>,
    pub cap:       Option<Cap>,
    pub sku:       Option<String>,
    #[serde(rename = "batterytype")]
    pub battery_type:   Option<String>,
    #[serde(rename = "soundver")]
    pub sound_ver:      Option<String>,
    #[serde(rename = "uiswver")]
    pub ui_sw_ver:      Option<String>,
    #[serde(rename = "navswver")]
    pub nav_sw_ver:     Option<String>,
    #[serde(rename = "wifiswver")]
    pub wifi_sw_ver:    Option<String>,
    #[serde(rename = "mobilityver")]
    pub mobility_ver:   Option<String>,
    #[serde(rename = "bootloaderver")]
    pub bootloader_ver: Option<String>,
    #[serde(rename = "umiver")]
    pub umi_ver:        Option<String>,
    #[serde(rename = "softwarever")]
    pub software_ver:   Option<String>,
    pub tz:       Option<Tz>,
    pub timezone: Option<String>,
    pub name:     Option<String>,
    #[serde(rename = "cleanschedule")]
    pub clean_schedule: Option<CleanSchedule>,
    pub bbchg3:   Option<BbChg3>,
    pub bbchg:    Option<BbChg>,
    pub bbswitch: Option<BbSwitch>,
    pub bbrun:    Option<BbRun>,
    pub bbsys:    Option<BbSys>,
    pub signal:   Option<Signal>,
}

// ── Network ───────────────────────────────────────────────────────────────────

/// Addresses are IPv4 packed into integers, host byte order as reported.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NetInfo {
    pub dhcp:  Option<bool>,
    pub addr:  Option<u32>,
    pub mask:  Option<u32>,
    pub gw:    Option<u32>,
    pub dns1:  Option<u32>,
    pub dns2:  Option<u32>,
    pub bssid: Option<String>,
    pub sec:   Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WifiStat {
    pub wifi:  Option<i64>,
    pub uap:   Option<bool>,
    pub cloud: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WlCfg {
    pub sec:  Option<i64>,
    /// Hex-encoded, as sent by `set_wifi`.
    pub ssid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SvcEndpoints {
    #[serde(rename = "svcdeplid")]
    pub svc_depl_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Signal {
    pub rssi: Option<i64>,
    pub snr:  Option<i64>,
}

// ── Mission ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Point {
    pub x: Option<i64>,
    pub y: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Pose {
    pub theta: Option<i64>,
    pub point: Option<Point>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Dock {
    pub known: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Bin {
    pub present: Option<bool>,
    pub full:    Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Audio {
    pub active: Option<bool>,
}

/// Current mission: `cycle` is e.g. "none"/"clean"/"spot", `phase` e.g.
/// "charge"/"run"/"hmUsrDock"/"stuck".
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CleanMissionStatus {
    pub cycle:     Option<String>,
    pub phase:     Option<String>,
    #[serde(rename = "expirem")]
    pub expire_m:  Option<i64>,
    #[serde(rename = "rechrgm")]
    pub rechrg_m:  Option<i64>,
    pub error:     Option<i64>,
    #[serde(rename = "notready")]
    pub not_ready: Option<i64>,
    #[serde(rename = "mssnm")]
    pub mssn_m:    Option<i64>,
    pub sqft:      Option<i64>,
    pub initiator: Option<String>,
    #[serde(rename = "nmssn")]
    pub n_mssn:    Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LastCommand {
    pub command:   Option<String>,
    pub time:      Option<i64>,
    pub initiator: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CleanSchedule {
    pub cycle: Option<Vec<String>>,
    pub h:     Option<Vec<i64>>,
    pub m:     Option<Vec<i64>>,
}

// ── Clock ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TzEvent {
    pub dt:  Option<i64>,
    pub off: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Tz {
    pub events: Option<Vec<TzEvent>>,
    pub ver:    Option<i64>,
}

// ── Capabilities ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Cap {
    pub pose:          Option<i64>,
    pub ota:           Option<i64>,
    #[serde(rename = "multipass")]
    pub multi_pass:    Option<i64>,
    #[serde(rename = "carpetboost")]
    pub carpet_boost:  Option<i64>,
    pub pp:            Option<i64>,
    #[serde(rename = "binfulldetect")]
    pub bin_full_detect: Option<i64>,
    #[serde(rename = "langota")]
    pub lang_ota:      Option<i64>,
    pub maps:          Option<i64>,
    pub edge:          Option<i64>,
    pub eco:           Option<i64>,
    #[serde(rename = "svcconf")]
    pub svc_conf:      Option<i64>,
}

// ── Black-box statistics ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BbNav {
    #[serde(rename = "amtrstallavgm")]
    pub a_mtr_stall_avg_m: Option<i64>,
    #[serde(rename = "againl")]
    pub a_gain_l: Option<i64>,
    #[serde(rename = "againr")]
    pub a_gain_r: Option<i64>,
    #[serde(rename = "aexpo")]
    pub a_expo:   Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BbPanic {
    pub panics: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BbMssn {
    #[serde(rename = "nmssn")]
    pub n_mssn:    Option<i64>,
    #[serde(rename = "nmssnok")]
    pub n_mssn_ok: Option<i64>,
    #[serde(rename = "nmssnc")]
    pub n_mssn_c:  Option<i64>,
    #[serde(rename = "nmssnf")]
    pub n_mssn_f:  Option<i64>,
    #[serde(rename = "amssnm")]
    pub a_mssn_m:  Option<i64>,
    #[serde(rename = "acyclem")]
    pub a_cycle_m: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BbRstInfo {
    #[serde(rename = "nnavrst")]
    pub n_nav_rst: Option<i64>,
    #[serde(rename = "nmobrst")]
    pub n_mob_rst: Option<i64>,
    pub causes:    Option<String>,
}

/// Charging statistics.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BbChg3 {
    #[serde(rename = "avgmin")]
    pub avg_min:     Option<i64>,
    #[serde(rename = "hondock")]
    pub h_on_dock:   Option<i64>,
    #[serde(rename = "navail")]
    pub n_avail:     Option<i64>,
    #[serde(rename = "estcap")]
    pub est_cap:     Option<i64>,
    #[serde(rename = "nlithchrg")]
    pub n_lith_chrg: Option<i64>,
    #[serde(rename = "nnimhchrg")]
    pub n_nimh_chrg: Option<i64>,
    #[serde(rename = "ndocks")]
    pub n_docks:     Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BbChg {
    #[serde(rename = "nchatters")]
    pub n_chatters:  Option<i64>,
    #[serde(rename = "nknockoffs")]
    pub n_knockoffs: Option<i64>,
    #[serde(rename = "nlithf")]
    pub n_lith_f:    Option<i64>,
    #[serde(rename = "nchgok")]
    pub n_chg_ok:    Option<i64>,
    pub aborts:      Option<Vec<i64>>,
    #[serde(rename = "nchgerr")]
    pub n_chg_err:   Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BbSwitch {
    #[serde(rename = "nbumper")]
    pub n_bumper: Option<i64>,
    #[serde(rename = "nclean")]
    pub n_clean:  Option<i64>,
    #[serde(rename = "nspot")]
    pub n_spot:   Option<i64>,
    #[serde(rename = "ndock")]
    pub n_dock:   Option<i64>,
    #[serde(rename = "ndrops")]
    pub n_drops:  Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BbRun {
    pub hr:   Option<i64>,
    pub min:  Option<i64>,
    pub sqft: Option<i64>,
    #[serde(rename = "nstuck")]
    pub n_stuck:    Option<i64>,
    #[serde(rename = "nscrubs")]
    pub n_scrubs:   Option<i64>,
    #[serde(rename = "npicks")]
    pub n_picks:    Option<i64>,
    #[serde(rename = "npanics")]
    pub n_panics:   Option<i64>,
    #[serde(rename = "ncliffsf")]
    pub n_cliffs_f: Option<i64>,
    #[serde(rename = "ncliffsr")]
    pub n_cliffs_r: Option<i64>,
    #[serde(rename = "nmbstll", alias = "nmbstall")]
    pub n_mb_stall: Option<i64>,
    #[serde(rename = "nwstll", alias = "nwstall")]
    pub n_w_stall:  Option<i64>,
    #[serde(rename = "ncbump")]
    pub n_c_bump:   Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BbSys {
    pub hr:  Option<i64>,
    pub min: Option<i64>,
}

// ── Raw message ───────────────────────────────────────────────────────────────

/// One telemetry message: the text as received plus its best-effort decode.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic:    String,
    pub text:     String,
    pub snapshot: Option<DeviceStateSnapshot>,
}

/// Decode one inbound payload.  Never fails: a payload that does not decode
/// yields `snapshot: None` alongside the original text.
pub fn decode(topic: &str, payload: &[u8]) -> RawMessage {
    let text = String::from_utf8_lossy(payload).into_owned();
    let snapshot = match decode_snapshot(&text) {
        Ok(s) => Some(s),
        Err(e) => {
            debug!("telemetry on {topic:?} not decoded: {e}");
            None
        }
    };
    RawMessage { topic: topic.to_string(), text, snapshot }
}

/// Strict form of [`decode`]: returns the decode error instead of `None`.
pub fn decode_snapshot(text: &str) -> Result<DeviceStateSnapshot> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| RoombaError::Decode(e.to_string()))?;
    serde_json::from_value(lowercase_keys(value)).map_err(|e| RoombaError::Decode(e.to_string()))
}

fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_lowercase(), lowercase_keys(v)))
                .collect::<Map<_, _>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}

// ── Schedule-only view ────────────────────────────────────────────────────────

/// The weekly schedule exactly as reported, Sunday first.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScheduleView {
    pub cycle: Vec<String>,
    pub h:     Vec<i64>,
    pub m:     Vec<i64>,
}

#[derive(Deserialize)]
struct ScheduleReport {
    state: ScheduleState,
}

#[derive(Deserialize)]
struct ScheduleState {
    reported: ScheduleReported,
}

#[derive(Deserialize)]
struct ScheduleReported {
    #[serde(rename = "cleanSchedule")]
    clean_schedule: ScheduleView,
}

/// Extract `state.reported.cleanSchedule` from a telemetry message.
///
/// Unlike [`decode`] this fails with [`RoombaError::Decode`] when the
/// schedule is missing or malformed.
pub fn parse_schedule(text: &str) -> Result<ScheduleView> {
    serde_json::from_str::<ScheduleReport>(text)
        .map(|r| r.state.reported.clean_schedule)
        .map_err(|e| RoombaError::Decode(format!("cleanSchedule: {e}")))
}
