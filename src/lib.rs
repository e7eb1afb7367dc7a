//! Local control client for iRobot Roomba vacuums.
//!
//! - [`discovery`] finds robots on the LAN and fetches their MQTT passwords
//! - [`session`] opens the robot's MQTT session and drives it
//! - [`command`] / [`state`] encode commands and decode telemetry
//!
//! ```no_run
//! # async fn demo() -> roomba_client::Result<()> {
//! use roomba_client::{Discovery, DiscoveryOptions, RoombaClient, SessionOptions};
//!
//! let roster = Discovery::new(DiscoveryOptions::default())?
//!     .run("192.168.1.255".parse().unwrap())
//!     .await?;
//! for robot in &roster {
//!     let opts = SessionOptions::new(robot.host().to_string(), robot.name(), robot.credential());
//!     let client = RoombaClient::connect(&opts).await?;
//!     client.on_message(|m| println!("{}", m.text));
//!     client.start().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod credential;
pub mod discovery;
pub mod error;
pub mod session;
pub mod state;
pub mod tls;

pub use command::{CleanAction, Command, Envelope, ScheduleEntry, WeeklySchedule, WifiSecurity};
pub use discovery::{DeviceIdentity, Discovery, DiscoveryOptions, StalledRetrieval};
pub use error::{Result, RoombaError};
pub use session::{MqttTransport, Observers, RoombaClient, SessionOptions, Transport};
pub use state::{DeviceStateSnapshot, RawMessage};
