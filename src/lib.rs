// SPDX-License-Identifier: Apache-2.0

pub mod analysis;
pub mod batch;
pub mod bounded_channel;
pub mod error;
pub mod fsop;
pub mod init;
pub mod logbuffer;
pub mod notifications;
pub mod save;
pub mod servicelog;
pub mod tail;
pub mod worklog;
