//! JSON frames exchanged with template workers.
//!
//! Every frame is an object with a numeric `id` and exactly one body key:
//!
//! ```text
//! -> {"id":0,"init":{"name":"t","expression":"return $.id"}}
//! <- {"id":0,"ready":{"pid":4242}}
//! -> {"id":1,"event":{"id":"a"}}
//! <- {"id":1,"result":"a"}
//! -> {"id":2,"event":{}}
//! <- {"id":2,"error":"TypeError: ..."}
//! -> {"id":0,"shutdown":{}}
//! ```
//!
//! Id `0` is reserved for control frames.

use crate::error::Error;
use crate::event::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

/// Id carried by control frames.
pub const CONTROL_ID: u64 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame<'a> {
    pub id: u64,
    #[serde(flatten)]
    pub body: Request<'a>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request<'a> {
    /// Compile the expression; answered with `Ready` or `Error`.
    Init {
        name: Cow<'a, str>,
        expression: Cow<'a, str>,
    },
    /// Evaluate the expression against one event.
    Event(Cow<'a, Event>),
    /// Exit after draining.
    Shutdown {},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(flatten)]
    pub body: Response,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ready { pid: u32 },
    Result(Value),
    Error(String),
}

impl<'a> RequestFrame<'a> {
    pub fn init(name: &'a str, expression: &'a str) -> Self {
        Self {
            id: CONTROL_ID,
            body: Request::Init {
                name: Cow::Borrowed(name),
                expression: Cow::Borrowed(expression),
            },
        }
    }

    pub fn event(id: u64, event: &'a Event) -> Self {
        Self {
            id,
            body: Request::Event(Cow::Borrowed(event)),
        }
    }

    pub fn shutdown() -> Self {
        Self {
            id: CONTROL_ID,
            body: Request::Shutdown {},
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|source| Error::SerdeJson { source })
    }

    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(|source| Error::SerdeJson { source })
    }
}

impl ResponseFrame {
    pub fn ready(pid: u32) -> Self {
        Self {
            id: CONTROL_ID,
            body: Response::Ready { pid },
        }
    }

    pub fn result(id: u64, value: Value) -> Self {
        Self {
            id,
            body: Response::Result(value),
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            body: Response::Error(message.into()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|source| Error::SerdeJson { source })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(|source| Error::SerdeJson { source })
    }
}
