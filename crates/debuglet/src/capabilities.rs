//! Capability advertisement for the `initialize` response.
//!
//! The payload is a static advertisement: identical for every session and
//! never adjusted to what the client says it supports.

use serde::{Deserialize, Serialize};

/// An exception-break filter the client may offer in its UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionBreakpointFilter {
    pub filter: String,
    pub label: String,
    pub default: bool,
}

impl ExceptionBreakpointFilter {
    fn new(filter: &str, label: &str, default: bool) -> Self {
        Self {
            filter: filter.to_string(),
            label: label.to_string(),
            default,
        }
    }
}

/// Features the engine supports. Field order is the wire order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub supports_exception_info_request: bool,
    pub supports_configuration_done_request: bool,
    pub supports_conditional_breakpoints: bool,
    pub supports_set_variable: bool,
    pub supports_value_formatting_options: bool,
    pub supports_exception_options: bool,
    pub exception_breakpoint_filters: Vec<ExceptionBreakpointFilter>,
    pub supports_evaluate_for_hovers: bool,
    pub supports_set_expression: bool,
    pub supports_modules_request: bool,
}

/// Build the capability set advertised in every `initialize` response.
pub fn capabilities() -> Capabilities {
    Capabilities {
        supports_exception_info_request: true,
        supports_configuration_done_request: true,
        supports_conditional_breakpoints: true,
        supports_set_variable: true,
        supports_value_formatting_options: true,
        supports_exception_options: true,
        exception_breakpoint_filters: vec![
            ExceptionBreakpointFilter::new("raised", "Raised Exceptions", false),
            ExceptionBreakpointFilter::new("uncaught", "Uncaught Exceptions", true),
        ],
        supports_evaluate_for_hovers: true,
        supports_set_expression: true,
        supports_modules_request: true,
    }
}
