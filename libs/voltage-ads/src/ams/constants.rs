//! AMS/TCP protocol constants

/// AMS/TCP prefix: reserved u16 + length u32
pub const AMS_TCP_HEADER_SIZE: usize = 6;
/// Fixed AMS header size
pub const AMS_HEADER_SIZE: usize = 32;
/// Upper bound for a single frame body; larger length fields are treated as corruption
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

// Command ids
pub const CMD_READ_DEVICE_INFO: u16 = 0x0001;
pub const CMD_READ: u16 = 0x0002;
pub const CMD_WRITE: u16 = 0x0003;
pub const CMD_READ_STATE: u16 = 0x0004;
pub const CMD_WRITE_CONTROL: u16 = 0x0005;
pub const CMD_ADD_NOTIFICATION: u16 = 0x0006;
pub const CMD_DEL_NOTIFICATION: u16 = 0x0007;
pub const CMD_DEVICE_NOTIFICATION: u16 = 0x0008;
pub const CMD_READ_WRITE: u16 = 0x0009;

// State flags
pub const STATE_FLAG_REQUEST: u16 = 0x0004;
pub const STATE_FLAG_RESPONSE: u16 = 0x0005;

// Symbol index groups
pub const ADSIGRP_SYM_HNDBYNAME: u32 = 0xF003;
pub const ADSIGRP_SYM_VALBYHND: u32 = 0xF005;
pub const ADSIGRP_SYM_RELEASEHND: u32 = 0xF006;

/// Notification transmission mode: server cycle, on change
pub const ADSTRANS_SERVERONCHA: u32 = 4;
/// Max delay and cycle time for on-change notifications, in 100ns units
pub const NOTIFICATION_MAX_DELAY: u32 = 0;
pub const NOTIFICATION_CYCLE_TIME: u32 = 0;
