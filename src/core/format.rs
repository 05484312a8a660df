use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use serde_json::Value;

use crate::error::Error;

pub(crate) const DEFAULT_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(
            byte,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(is_token_byte)
}

fn is_valid_value_byte(byte: u8) -> bool {
    (0x20..=0x7e).contains(&byte) || byte >= 0x80
}

/// Renders a dynamically typed header value to text. `None` means the entry
/// is skipped (null, or empty after trimming).
fn render_header_value(name: &str, value: &Value) -> Result<Option<String>, Error> {
    let text = match value {
        Value::Null => return Ok(None),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => {
            return Err(Error::InvalidHeaderValue {
                name: name.to_owned(),
                message: "structured values are not valid header values".to_owned(),
            });
        }
    };

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if let Some(invalid) = trimmed.bytes().find(|byte| !is_valid_value_byte(*byte)) {
        return Err(Error::InvalidHeaderValue {
            name: name.to_owned(),
            message: format!("value contains forbidden byte 0x{invalid:02x}"),
        });
    }
    Ok(Some(trimmed.to_owned()))
}

/// Produces the wire-ready `Name: value` lines for a header set. Entries
/// with null or empty values are skipped; names must match the RFC 7230
/// token grammar; values are trimmed and may not contain control bytes.
pub fn format_headers(headers: &[(String, Value)]) -> Result<Vec<String>, Error> {
    let mut lines = Vec::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_valid_header_name(name) {
            return Err(Error::InvalidHeaderName { name: name.clone() });
        }
        if let Some(rendered) = render_header_value(name, value)? {
            lines.push(format!("{name}: {rendered}"));
        }
    }
    Ok(lines)
}

/// Lowers a validated header set onto `http::HeaderMap` for the driver.
pub(crate) fn wire_headers(headers: &[(String, Value)]) -> Result<HeaderMap, Error> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_valid_header_name(name) {
            return Err(Error::InvalidHeaderName { name: name.clone() });
        }
        let Some(rendered) = render_header_value(name, value)? else {
            continue;
        };
        let header_name: HeaderName =
            name.parse()
                .map_err(|_| Error::InvalidHeaderName { name: name.clone() })?;
        let header_value =
            HeaderValue::from_str(&rendered).map_err(|source| Error::InvalidHeaderValue {
                name: name.clone(),
                message: source.to_string(),
            })?;
        map.append(header_name, header_value);
    }
    Ok(map)
}

/// Case-insensitive content-type lookup with the form-encoded default.
pub fn content_type(headers: &[(String, Value)]) -> String {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .and_then(|(name, value)| render_header_value(name, value).ok().flatten())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned())
}

/// Case-insensitive union where `custom` wins; the casing of whichever side
/// supplied a key last is preserved.
pub fn merge_headers(custom: &[(String, Value)], defaults: &[(String, Value)]) -> Vec<(String, Value)> {
    let mut merged: Vec<(String, Value)> = defaults.to_vec();
    for (name, value) in custom {
        if let Some(slot) = merged
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            *slot = (name.clone(), value.clone());
        } else {
            merged.push((name.clone(), value.clone()));
        }
    }
    merged
}

fn append_form_value(
    serializer: &mut url::form_urlencoded::Serializer<'_, String>,
    key: &str,
    value: &Value,
) -> Result<(), Error> {
    match value {
        Value::Null => {}
        Value::String(text) => {
            serializer.append_pair(key, text);
        }
        Value::Bool(flag) => {
            serializer.append_pair(key, &flag.to_string());
        }
        Value::Number(number) => {
            serializer.append_pair(key, &number.to_string());
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                append_form_value(serializer, &format!("{key}[{index}]"), item)?;
            }
        }
        Value::Object(entries) => {
            for (child_key, child) in entries {
                append_form_value(serializer, &format!("{key}[{child_key}]"), child)?;
            }
        }
    }
    Ok(())
}

fn encode_form(body: &Value) -> Result<String, Error> {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    match body {
        Value::Object(entries) => {
            for (key, value) in entries {
                append_form_value(&mut serializer, key, value)?;
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                append_form_value(&mut serializer, &index.to_string(), item)?;
            }
        }
        _ => {
            return Err(Error::Serialize {
                message: "form body must be an object or array".to_owned(),
            });
        }
    }
    Ok(serializer.finish())
}

/// Serializes a request body according to the effective content type:
/// null passes through as no body, strings pass through verbatim, a
/// json content type gets JSON encoding, structured values otherwise get
/// form encoding, and remaining scalars are string cast.
pub fn format_params(body: &Value, headers: &[(String, Value)]) -> Result<Option<String>, Error> {
    if body.is_null() {
        return Ok(None);
    }
    if let Value::String(text) = body {
        return Ok(Some(text.clone()));
    }

    let effective = content_type(headers).to_ascii_lowercase();
    if effective.contains("json") {
        let encoded = serde_json::to_string(body).map_err(|source| Error::Serialize {
            message: source.to_string(),
        })?;
        return Ok(Some(encoded));
    }

    match body {
        Value::Object(_) | Value::Array(_) => encode_form(body).map(Some),
        Value::Bool(flag) => Ok(Some(flag.to_string())),
        Value::Number(number) => Ok(Some(number.to_string())),
        _ => Ok(None),
    }
}

fn build_query_string(existing: &[(String, String)], appended: &[(String, String)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in existing {
        serializer.append_pair(name, value);
    }
    for (name, value) in appended {
        serializer.append_pair(name, value);
    }
    serializer.finish()
}

/// Appends URL-encoded query pairs to a url, merging with any query string
/// already present. An empty query map returns the url unchanged.
pub fn build_url(url: &str, query: &[(String, String)]) -> String {
    if query.is_empty() {
        return url.to_owned();
    }

    if let Ok(mut parsed) = url::Url::parse(url) {
        let existing = parsed
            .query()
            .map(|raw| {
                url::form_urlencoded::parse(raw.as_bytes())
                    .map(|(name, value)| (name.into_owned(), value.into_owned()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let merged = build_query_string(&existing, query);
        parsed.set_query(Some(&merged));
        return parsed.to_string();
    }

    let (without_fragment, fragment) = match url.split_once('#') {
        Some((left, right)) => (left, Some(right)),
        None => (url, None),
    };
    let (base, existing_query) = match without_fragment.split_once('?') {
        Some((left, right)) => (left, Some(right)),
        None => (without_fragment, None),
    };
    let existing = existing_query
        .map(|raw| {
            url::form_urlencoded::parse(raw.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let merged = build_query_string(&existing, query);

    let mut rebuilt = format!("{base}?{merged}");
    if let Some(fragment) = fragment {
        rebuilt.push('#');
        rebuilt.push_str(fragment);
    }
    rebuilt
}
