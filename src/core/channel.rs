// Channel - the fixed set of source platforms a record can be scoped to

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{AppError, AppResult};

/// Source platform of a channeled entity. The integer values are what storage
/// holds; the symbolic names are what readers see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shopify = 1,
    Klaviyo = 2,
    Facebook = 3,
    Bigcommerce = 4,
    Netsuite = 5,
    Amazon = 6,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Shopify,
        Channel::Klaviyo,
        Channel::Facebook,
        Channel::Bigcommerce,
        Channel::Netsuite,
        Channel::Amazon,
    ];

    pub fn value(self) -> i64 {
        self as i64
    }

    pub fn name(self) -> &'static str {
        match self {
            Channel::Shopify => "shopify",
            Channel::Klaviyo => "klaviyo",
            Channel::Facebook => "facebook",
            Channel::Bigcommerce => "bigcommerce",
            Channel::Netsuite => "netsuite",
            Channel::Amazon => "amazon",
        }
    }

    pub fn from_value(value: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.value() == value)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_channel(s)
    }
}

/// Anything a caller may pass where a channel is expected.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelArg {
    Channel(Channel),
    Value(i64),
    Name(String),
}

impl From<Channel> for ChannelArg {
    fn from(channel: Channel) -> Self {
        ChannelArg::Channel(channel)
    }
}

impl From<i64> for ChannelArg {
    fn from(value: i64) -> Self {
        ChannelArg::Value(value)
    }
}

impl From<i32> for ChannelArg {
    fn from(value: i32) -> Self {
        ChannelArg::Value(value as i64)
    }
}

impl From<&str> for ChannelArg {
    fn from(name: &str) -> Self {
        ChannelArg::Name(name.to_string())
    }
}

impl From<String> for ChannelArg {
    fn from(name: String) -> Self {
        ChannelArg::Name(name)
    }
}

impl From<&String> for ChannelArg {
    fn from(name: &String) -> Self {
        ChannelArg::Name(name.clone())
    }
}

impl fmt::Display for ChannelArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelArg::Channel(c) => write!(f, "{}", c),
            ChannelArg::Value(v) => write!(f, "{}", v),
            ChannelArg::Name(n) => write!(f, "{}", n),
        }
    }
}

/// Resolve a channel from its enum value, integer value, or symbolic name.
///
/// Every repository goes through this one function, so an unknown channel is
/// always rejected before any storage work happens. Numeric strings are
/// treated as integer values.
pub fn validate_channel(arg: impl Into<ChannelArg>) -> AppResult<Channel> {
    let arg = arg.into();
    let resolved = match &arg {
        ChannelArg::Channel(c) => Some(*c),
        ChannelArg::Value(v) => Channel::from_value(*v),
        ChannelArg::Name(n) => {
            let trimmed = n.trim();
            match trimmed.parse::<i64>() {
                Ok(v) => Channel::from_value(v),
                Err(_) => Channel::from_name(trimmed),
            }
        }
    };
    resolved.ok_or_else(|| AppError::InvalidChannel(format!("Invalid channel: {}", arg)))
}

/// Resolve a channel held in a loosely-typed JSON value.
pub fn channel_from_json(value: &Value) -> AppResult<Channel> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(v) => validate_channel(v),
            None => Err(AppError::InvalidChannel(format!("Invalid channel: {}", n))),
        },
        Value::String(s) => validate_channel(s.as_str()),
        other => Err(AppError::InvalidChannel(format!("Invalid channel: {}", other))),
    }
}
