//! Media types accepted and produced by the HTTP endpoints.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unsupported media type '{0}'")]
pub struct UnsupportedMediaType(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Protobuf,
    Json,
    RecordIoProtobuf,
    RecordIoJson,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Protobuf => "application/x-protobuf",
            ContentType::Json => "application/json",
            ContentType::RecordIoProtobuf => "application/recordio+x-protobuf",
            ContentType::RecordIoJson => "application/recordio+json",
        }
    }

    pub fn is_streaming(self) -> bool {
        matches!(self, ContentType::RecordIoProtobuf | ContentType::RecordIoJson)
    }

    /// Only JSON encodings are served; protobuf bodies are rejected.
    pub fn is_supported(self) -> bool {
        matches!(self, ContentType::Json | ContentType::RecordIoJson)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = UnsupportedMediaType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let essence = s.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "application/json" => Ok(ContentType::Json),
            "application/x-protobuf" => Ok(ContentType::Protobuf),
            "application/recordio+json" => Ok(ContentType::RecordIoJson),
            "application/recordio+x-protobuf" => Ok(ContentType::RecordIoProtobuf),
            _ => Err(UnsupportedMediaType(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("application/json", ContentType::Json)]
    #[case("application/json; charset=utf-8", ContentType::Json)]
    #[case("Application/X-Protobuf", ContentType::Protobuf)]
    #[case("application/recordio+json", ContentType::RecordIoJson)]
    fn test_parse(#[case] input: &str, #[case] expected: ContentType) {
        assert_eq!(input.parse::<ContentType>(), Ok(expected));
    }

    #[test]
    fn test_unknown_media_type() {
        assert!("text/plain".parse::<ContentType>().is_err());
    }

    #[test]
    fn test_only_json_supported() {
        assert!(ContentType::Json.is_supported());
        assert!(!ContentType::Protobuf.is_supported());
        assert!(ContentType::RecordIoJson.is_streaming());
    }
}
