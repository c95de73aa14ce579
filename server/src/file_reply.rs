use std::fmt::Write;

use axum::{
    body::Body,
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
};
use kernel::EntryMetadata;
use utoipa::{
    openapi::{
        self, content,
        schema::{KnownFormat, ObjectBuilder, Schema, SchemaFormat, Type},
        RefOr, ResponseBuilder,
    },
    ToResponse,
};

/// Streamed file contents together with the headers describing them.
pub struct FileReply {
    body: Body,
    entry: EntryMetadata,
}

impl FileReply {
    #[must_use]
    pub fn new(body: Body, entry: EntryMetadata) -> Self {
        Self { body, entry }
    }
}

impl IntoResponse for FileReply {
    fn into_response(self) -> Response {
        let disposition = content_disposition(self.entry.filename.as_str());
        let mut res = self.body.into_response();
        let headers = res.headers_mut();
        let content_type = HeaderValue::from_str(&self.entry.content_type)
            .unwrap_or(HeaderValue::from_static(kernel::DEFAULT_CONTENT_TYPE));
        headers.insert(header::CONTENT_TYPE, content_type);
        if let Ok(val) = HeaderValue::from_str(&disposition) {
            headers.insert(header::CONTENT_DISPOSITION, val);
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.entry.size));
        res
    }
}

impl ToResponse<'static> for FileReply {
    fn response() -> (&'static str, RefOr<openapi::Response>) {
        let object = ObjectBuilder::new()
            .schema_type(Type::String)
            .format(Some(SchemaFormat::KnownFormat(KnownFormat::Binary)))
            .build();
        let content = content::Content::new(Some(Schema::Object(object)));
        (
            "FileReply",
            ResponseBuilder::new()
                .description("File binary content")
                .content("application/octet-stream", content)
                .build()
                .into(),
        )
    }
}

/// Builds an `inline` disposition. Names that aren't plain ASCII also get an
/// RFC 5987 `filename*` parameter.
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    let mut value = format!(r#"inline; filename="{fallback}""#);
    if fallback != filename {
        value.push_str("; filename*=UTF-8''");
        for b in filename.bytes() {
            if b.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&b) {
                value.push(char::from(b));
            } else {
                let _ = write!(value, "%{b:02X}");
            }
        }
    }
    value
}
