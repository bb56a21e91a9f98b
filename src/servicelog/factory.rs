// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::logbuffer::{BufferConf, LogBuffer};
use crate::servicelog::{
    APP_TYPE_KONTEXT, APP_TYPE_MAPKA, AppRecord, OutputRecord, ProcessingError, kontext, mapka,
};

/// Line parser of one supported application version.
pub enum LineParser {
    Kontext(kontext::LineParser),
    Mapka(mapka::LineParser),
}

impl LineParser {
    pub fn parse_line(&self, line: &str, line_num: i64) -> std::result::Result<AppRecord, ProcessingError> {
        match self {
            LineParser::Kontext(p) => p.parse_line(line, line_num).map(AppRecord::Kontext),
            LineParser::Mapka(p) => p.parse_line(line, line_num).map(AppRecord::Mapka),
        }
    }
}

/// Settings shared by all transformers.
#[derive(Debug, Clone, Default)]
pub struct TransformerSettings {
    pub tz_shift_min: i32,
    pub anonymous_users: Vec<i64>,
    pub buffer: Option<BufferConf>,
}

pub enum Transformer {
    Kontext(kontext::Transformer),
    Mapka(mapka::Transformer),
}

impl Transformer {
    /// Turn one record into zero or more records; the buffer gives access to
    /// the client's recent history.
    pub fn preprocess(&self, rec: AppRecord, buffer: &LogBuffer<AppRecord>) -> Vec<AppRecord> {
        match self {
            Transformer::Kontext(t) => t.preprocess(rec, buffer),
            Transformer::Mapka(t) => t.preprocess(rec, buffer),
        }
    }

    pub fn transform(&self, rec: &AppRecord) -> std::result::Result<OutputRecord, ProcessingError> {
        match (self, rec) {
            (Transformer::Kontext(t), AppRecord::Kontext(r)) => t.transform(r).map(OutputRecord::Kontext),
            (Transformer::Mapka(t), AppRecord::Mapka(r)) => t.transform(r).map(OutputRecord::Mapka),
            _ => Err(ProcessingError::Transform(format!(
                "record of another application passed to the {} transformer",
                self.app_type()
            ))),
        }
    }

    pub fn history_lookup_items(&self) -> usize {
        match self {
            Transformer::Kontext(t) => t.history_lookup_items(),
            Transformer::Mapka(t) => t.history_lookup_items(),
        }
    }

    pub fn app_type(&self) -> &str {
        match self {
            Transformer::Kontext(t) => &t.app_type,
            Transformer::Mapka(t) => &t.app_type,
        }
    }
}

fn unsupported(app_type: &str, version: &str) -> Error {
    Error::Config(format!(
        "unsupported application {} (version {:?})",
        app_type, version
    ))
}

/// Matches `wanted` against the configured version, ignoring a trailing
/// ".0" patch style suffix ("0.18" == "0.18.0").
fn version_is(version: &str, wanted: &str) -> bool {
    version == wanted || version.strip_suffix(".0") == Some(wanted)
}

pub fn new_line_parser(app_type: &str, version: &str) -> Result<LineParser> {
    match app_type {
        APP_TYPE_KONTEXT if version_is(version, "0.18") => Ok(LineParser::Kontext(kontext::LineParser)),
        APP_TYPE_MAPKA if version_is(version, "3") => Ok(LineParser::Mapka(mapka::LineParser::new()?)),
        _ => Err(unsupported(app_type, version)),
    }
}

pub fn new_transformer(
    app_type: &str,
    version: &str,
    settings: TransformerSettings,
) -> Result<Transformer> {
    match app_type {
        APP_TYPE_KONTEXT if version_is(version, "0.18") => Ok(Transformer::Kontext(kontext::Transformer {
            app_type: app_type.to_string(),
            tz_shift_min: settings.tz_shift_min,
            anonymous_users: settings.anonymous_users,
            buffer_conf: settings.buffer,
        })),
        APP_TYPE_MAPKA if version_is(version, "3") => Ok(Transformer::Mapka(mapka::Transformer {
            app_type: app_type.to_string(),
            tz_shift_min: settings.tz_shift_min,
            anonymous_users: settings.anonymous_users,
            buffer_conf: settings.buffer,
        })),
        _ => Err(unsupported(app_type, version)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_apps() {
        assert!(matches!(new_line_parser("kontext", "0.18"), Ok(LineParser::Kontext(_))));
        assert!(matches!(new_line_parser("mapka", "3.0"), Ok(LineParser::Mapka(_))));
        let t = new_transformer("mapka", "3", TransformerSettings::default()).unwrap();
        assert_eq!(t.app_type(), "mapka");
        assert_eq!(t.history_lookup_items(), 0);
    }

    #[test]
    fn test_unknown_app_or_version_is_config_error() {
        assert!(matches!(new_line_parser("kontext", "0.17"), Err(Error::Config(_))));
        assert!(matches!(
            new_transformer("treq", "1", TransformerSettings::default()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_transform_rejects_foreign_record() {
        let mapka = new_transformer("mapka", "3", TransformerSettings::default()).unwrap();
        let kontext_rec = new_line_parser("kontext", "0.18")
            .unwrap()
            .parse_line(r#"{"date": "2024-01-01T00:00:00Z", "action": "view"}"#, 1)
            .unwrap();
        assert!(matches!(
            mapka.transform(&kontext_rec),
            Err(ProcessingError::Transform(_))
        ));
    }
}
