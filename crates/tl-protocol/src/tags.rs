//! Numeric payload-type tags.
//!
//! The session only interprets the reserved set below; every other tag flows
//! through opaquely and is classified by number alone.

/// Keepalive event, empty payload, sent by both sides.
pub const KEEPALIVE: u32 = 51;

pub const APP_AUTH_REQ: u32 = 2100;
pub const APP_AUTH_RES: u32 = 2101;
pub const ACCOUNT_AUTH_REQ: u32 = 2102;
pub const ACCOUNT_AUTH_RES: u32 = 2103;

pub const SYMBOLS_LIST_REQ: u32 = 2114;
pub const SYMBOLS_LIST_RES: u32 = 2115;
pub const TRADER_REQ: u32 = 2121;
pub const TRADER_RES: u32 = 2122;
pub const RECONCILE_REQ: u32 = 2124;
pub const RECONCILE_RES: u32 = 2125;

/// Order/position lifecycle push; flows without an explicit subscription.
pub const EXECUTION_EVENT: u32 = 2126;

pub const SUBSCRIBE_SPOTS_REQ: u32 = 2127;
pub const SUBSCRIBE_SPOTS_RES: u32 = 2128;
pub const UNSUBSCRIBE_SPOTS_REQ: u32 = 2129;
pub const UNSUBSCRIBE_SPOTS_RES: u32 = 2130;

/// Tick push, optionally carrying live trendbar data.
pub const SPOT_EVENT: u32 = 2131;

pub const SUBSCRIBE_TRENDBAR_REQ: u32 = 2135;
pub const SUBSCRIBE_TRENDBAR_RES: u32 = 2136;
pub const UNSUBSCRIBE_TRENDBAR_REQ: u32 = 2137;
pub const UNSUBSCRIBE_TRENDBAR_RES: u32 = 2138;

/// The generic remote error response; terminates the correlated request.
pub const ERROR_RES: u32 = 2142;

/// Incremental depth push.
pub const DEPTH_EVENT: u32 = 2155;

pub const SUBSCRIBE_DEPTH_REQ: u32 = 2156;
pub const SUBSCRIBE_DEPTH_RES: u32 = 2157;
pub const UNSUBSCRIBE_DEPTH_REQ: u32 = 2158;
pub const UNSUBSCRIBE_DEPTH_RES: u32 = 2159;
