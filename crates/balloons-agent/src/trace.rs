//! Trace exporter selection.
//!
//! The exporter implementation is a collaborator; the agent only carries
//! the selection and the endpoint it resolves to.

use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceExporter {
    OtlpHttp,
    OtlpGrpc,
}

impl TraceExporter {
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            TraceExporter::OtlpHttp => "localhost:4318",
            TraceExporter::OtlpGrpc => "localhost:4317",
        }
    }
}

impl FromStr for TraceExporter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "otlp-http" => Ok(TraceExporter::OtlpHttp),
            "otlp-grpc" => Ok(TraceExporter::OtlpGrpc),
            other => Err(format!("unknown trace exporter {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TraceConfig {
    pub exporter: Option<TraceExporter>,
    pub endpoint: Option<String>,
}

impl TraceConfig {
    /// The endpoint the selected exporter should talk to.
    pub fn resolved_endpoint(&self) -> Option<String> {
        let exporter = self.exporter?;
        Some(
            self.endpoint
                .clone()
                .unwrap_or_else(|| exporter.default_endpoint().to_string()),
        )
    }
}
