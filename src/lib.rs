//! Client for the ProCon.IP pool controller's HTTP interface.
//!
//! [`poll::Poller`] keeps a [`frame::Frame`] of `/GetState.csv` fresh, [`relay`] works out the
//! bit patterns needed to switch a relay, and [`services`] sends the write commands.

pub mod category;
pub mod column;
pub mod commands;
pub mod connection;
pub mod frame;
pub mod output;
pub mod poll;
pub mod relay;
pub mod services;
pub mod sys_info;
