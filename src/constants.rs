use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// How a port reports back to the UI once its handler settles.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Default,
    Serialize, Deserialize, JsonSchema, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum CallbackMode {
    /// Never reply.
    None,
    /// Reply with the result; failures are only logged.
    Result,
    /// Reply with `null` on success and the error on failure.
    #[default]
    Error,
    /// Always reply with an error slot and a result slot.
    ResultOrError,
}

impl CallbackMode {
    pub fn replies(self) -> bool {
        self != CallbackMode::None
    }
}

/// Verbosity threshold for everything logged during and after one attach call.
/// Higher values log more.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    Serialize, Deserialize, JsonSchema, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum LogLevel {
    None = 0,
    #[default]
    Errors = 1,
    Result = 2,
    Debug = 3,
}
