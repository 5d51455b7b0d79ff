//! Tool-call parser.
//!
//! Extracts the first `<tool>...</tool>` block from a streamed model
//! utterance, splits it from surrounding thinking/message text, and decodes
//! the inner `<arguments>` XML into a JSON value. Also implements the
//! "early detection" scan used by the stream processor to surface a tool
//! name before the full block has closed.

use std::sync::LazyLock;

use quick_xml::events::Event as XmlEvent;
use quick_xml::reader::Reader;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::ForgeError;

/// Parsed form of a `<tool>` block (C2/C7 shared shape).
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Defaults to `"local"` when the block omits `<server_name>`. Retained
    /// for forward compatibility; dispatch never branches on it (see
    /// DESIGN.md open-question 3).
    pub server_name: String,
    pub tool_name: String,
    /// Raw inner XML of the `<arguments>` element, preserved verbatim so it
    /// can be re-decoded once the target tool's schema is known.
    pub arguments_xml: String,
}

static TOOL_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tool>(.*?)</tool>").unwrap());

/// Restricted early-detect pattern: only `<tool_name>...</tool_name>`, not
/// the full block, so it can resolve mid-stream before `</tool>` arrives.
static TOOL_NAME_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<tool_name>\s*([a-z_][a-z0-9_]*)\s*</tool_name>").unwrap());

/// Named and numeric XML entities that must not be re-escaped.
static VALID_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^&(amp|lt|gt|quot|apos|#[0-9]+|#x[0-9A-Fa-f]+);").unwrap());

static BARE_AMPERSAND: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"&").unwrap());

/// Result of splitting a full model utterance by the first `<tool>` block.
pub struct SplitUtterance<'a> {
    pub thinking: Option<&'a str>,
    pub tool_block: Option<&'a str>,
    pub remaining: &'a str,
}

/// Locate the first non-overlapping `<tool>...</tool>` block and split the
/// surrounding text around it, by position rather than textual heuristics.
pub fn find_tool_block(text: &str) -> Option<(usize, usize)> {
    TOOL_BLOCK.find(text).map(|m| (m.start(), m.end()))
}

/// Early-detect the tool name from a (possibly incomplete) `<tool>` buffer,
/// as soon as `<tool_name>...</tool_name>` has closed.
pub fn early_detect_tool_name(buffer: &str) -> Option<String> {
    TOOL_NAME_TAG
        .captures(buffer)
        .map(|c| c[1].to_string())
}

const CDATA_START: &str = "<![CDATA[";
const CDATA_END: &str = "]]>";

/// Replace unescaped ampersands (not already part of a valid entity) with
/// `&amp;`, leaving well-formed entities untouched. `<![CDATA[...]]>` spans
/// are copied through verbatim: their content is character data, not
/// markup, so an `&` inside one is already well-formed and must not be
/// re-escaped.
pub fn normalize_ampersands(xml: &str) -> String {
    let mut out = String::with_capacity(xml.len());
    let mut rest = xml;
    loop {
        match rest.find(CDATA_START) {
            Some(cdata_pos) => {
                out.push_str(&normalize_ampersands_outside_cdata(&rest[..cdata_pos]));
                let from_cdata = &rest[cdata_pos..];
                match from_cdata.find(CDATA_END) {
                    Some(end_rel) => {
                        let end_abs = end_rel + CDATA_END.len();
                        out.push_str(&from_cdata[..end_abs]);
                        rest = &from_cdata[end_abs..];
                    }
                    None => {
                        out.push_str(from_cdata);
                        break;
                    }
                }
            }
            None => {
                out.push_str(&normalize_ampersands_outside_cdata(rest));
                break;
            }
        }
    }
    out
}

fn normalize_ampersands_outside_cdata(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    loop {
        match BARE_AMPERSAND.find(rest) {
            Some(m) => {
                out.push_str(&rest[..m.start()]);
                let tail = &rest[m.start()..];
                if VALID_ENTITY.is_match(tail) {
                    out.push('&');
                } else {
                    out.push_str("&amp;");
                }
                rest = &rest[m.end()..];
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out
}

/// Parse a full `<tool>...</tool>` slice (inclusive of the tags) into a
/// [`ToolCall`]. Does not validate `arguments_xml` against a schema; callers
/// decode it later via [`decode_arguments`].
pub fn parse_tool_call(block: &str) -> Result<ToolCall, ForgeError> {
    let normalized = normalize_ampersands(block);
    let mut reader = Reader::from_str(&normalized);
    reader.config_mut().trim_text(true);

    let mut server_name = None;
    let mut tool_name = None;
    let mut arguments_xml = None;

    // Stack of currently-open element names, used to know which leaf we're
    // reading text for and to re-serialize <arguments> verbatim.
    let mut path: Vec<String> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "arguments" {
                    // Re-slice the raw (normalized) text between this start
                    // tag and its matching end tag, preserving the original
                    // markup (including CDATA) for later re-decoding.
                    let start_pos = reader.buffer_position() as usize;
                    let depth_close = find_matching_close(&normalized, start_pos, "arguments");
                    if let Some(end_pos) = depth_close {
                        arguments_xml = Some(normalized[start_pos..end_pos].to_string());
                    }
                }
                path.push(name);
            }
            Ok(XmlEvent::End(_)) => {
                path.pop();
            }
            Ok(XmlEvent::Text(t)) => {
                let text = t.unescape().unwrap_or_default().into_owned();
                match path.last().map(|s| s.as_str()) {
                    Some("server_name") => server_name = Some(text.trim().to_string()),
                    Some("tool_name") => tool_name = Some(text.trim().to_string()),
                    _ => {}
                }
            }
            Ok(XmlEvent::CData(t)) => {
                let text = String::from_utf8_lossy(t.as_ref()).into_owned();
                match path.last().map(|s| s.as_str()) {
                    Some("server_name") => server_name = Some(text.trim().to_string()),
                    Some("tool_name") => tool_name = Some(text.trim().to_string()),
                    _ => {}
                }
            }
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ForgeError::MalformedToolCall(e.to_string())),
        }
        buf.clear();
    }

    let tool_name = tool_name.ok_or(ForgeError::MalformedToolCall(
        "missing <tool_name>".to_string(),
    ))?;

    Ok(ToolCall {
        server_name: server_name.unwrap_or_else(|| "local".to_string()),
        tool_name,
        arguments_xml: arguments_xml.unwrap_or_default(),
    })
}

/// Find the byte offset of the `</name>` tag matching the `<name>` that was
/// just opened, accounting for nested same-named elements.
fn find_matching_close(haystack: &str, from: usize, name: &str) -> Option<usize> {
    let open = format!("<{name}");
    let close = format!("</{name}>");
    let mut depth = 1usize;
    let mut pos = from;
    while let Some(next_close) = haystack[pos..].find(&close) {
        let close_abs = pos + next_close;
        // Any <name...> opening strictly between pos and close_abs increases depth.
        let mut scan = pos;
        while let Some(next_open) = haystack[scan..close_abs].find(&open) {
            let open_abs = scan + next_open;
            // Ensure it's a real tag start, not a longer tag name sharing the prefix.
            let after = haystack[open_abs + open.len()..].chars().next();
            if matches!(after, Some('>') | Some(' ') | Some('/')) {
                depth += 1;
            }
            scan = open_abs + open.len();
        }
        depth -= 1;
        if depth == 0 {
            return Some(close_abs);
        }
        pos = close_abs + close.len();
    }
    None
}

/// Decode the inner XML of an `<arguments>` element into a JSON object.
/// When `schema` is given (the target tool's JSON-Schema parameter
/// document), each child is decoded per its declared `"type"` rather than
/// guessed from the literal text — a `"type": "string"` field stays a
/// string even if its content happens to look like a number or boolean.
/// Fields absent from the schema (or when `schema` is `None`, e.g. before
/// the target tool is known) fall back to a string/number/boolean guess.
/// Repeated same-named children become a JSON array; a single
/// CDATA-wrapped child decodes to its unwrapped text.
pub fn decode_arguments(arguments_xml: &str, schema: Option<&Value>) -> Result<Value, ForgeError> {
    if arguments_xml.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    let wrapped = format!("<arguments>{}</arguments>", normalize_ampersands(arguments_xml));
    let mut reader = Reader::from_str(&wrapped);
    reader.config_mut().trim_text(true);

    let mut map: Map<String, Value> = Map::new();
    let mut stack: Vec<(String, Vec<Value>, String)> = Vec::new(); // (name, children-seen, text-acc)
    let mut buf = Vec::new();
    let mut depth = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                depth += 1;
                if depth > 1 {
                    stack.push((name, Vec::new(), String::new()));
                }
            }
            Ok(XmlEvent::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if depth == 0 {
                    continue;
                }
                let type_hint = declared_type_for(schema, &stack, &name);
                insert_scalar(&mut map, &mut stack, &name, scalar_from_text("", type_hint));
            }
            Ok(XmlEvent::End(_)) => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
                if depth >= 1 {
                    if let Some((name, children, text)) = stack.pop() {
                        let value = if !children.is_empty() {
                            Value::Array(children)
                        } else {
                            let type_hint = declared_type_for(schema, &stack, &name);
                            scalar_from_text(&text, type_hint)
                        };
                        insert_scalar(&mut map, &mut stack, &name, value);
                    }
                }
            }
            Ok(XmlEvent::Text(t)) => {
                let text = t.unescape().unwrap_or_default().into_owned();
                if let Some(top) = stack.last_mut() {
                    top.2.push_str(&text);
                }
            }
            Ok(XmlEvent::CData(t)) => {
                let text = String::from_utf8_lossy(t.as_ref()).into_owned();
                if let Some(top) = stack.last_mut() {
                    top.2.push_str(&text);
                }
            }
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ForgeError::MalformedToolCall(e.to_string())),
        }
        buf.clear();
    }

    Ok(Value::Object(map))
}

/// Insert a decoded child value either into a parent list-in-progress on
/// the stack, or directly into the root arguments map.
fn insert_scalar(
    map: &mut Map<String, Value>,
    stack: &mut [(String, Vec<Value>, String)],
    name: &str,
    value: Value,
) {
    if let Some(parent) = stack.last_mut() {
        parent.1.push(value);
        let _ = name;
    } else {
        map.insert(name.to_string(), value);
    }
}

/// Resolve the JSON-Schema `"type"` declared for `name`, given the stack of
/// still-open ancestors. A direct child of `<arguments>` (an empty stack at
/// insertion time) looks up `schema.properties[name].type`; a child nested
/// one level inside an array-typed field looks up that field's
/// `items.type` instead.
fn declared_type_for<'a>(
    schema: Option<&'a Value>,
    stack: &[(String, Vec<Value>, String)],
    name: &str,
) -> Option<&'a str> {
    let schema = schema?;
    let properties = schema.get("properties")?.as_object()?;
    match stack.last() {
        None => properties.get(name)?.get("type")?.as_str(),
        Some((parent_name, ..)) => properties
            .get(parent_name.as_str())?
            .get("items")?
            .get("type")?
            .as_str(),
    }
}

/// Decode one leaf's accumulated text into a JSON value. With a declared
/// `type_hint` the field is decoded exactly as the schema says (a
/// `"string"` field is never promoted to a number or boolean); without one
/// the literal is guessed from its shape.
fn scalar_from_text(text: &str, type_hint: Option<&str>) -> Value {
    let trimmed = text.trim();
    match type_hint {
        Some("string") => Value::String(trimmed.to_string()),
        Some("boolean") => trimmed
            .parse::<bool>()
            .map(Value::Bool)
            .unwrap_or_else(|_| Value::String(trimmed.to_string())),
        Some("integer") => trimmed
            .parse::<i64>()
            .map(|i| Value::Number(i.into()))
            .unwrap_or_else(|_| Value::String(trimmed.to_string())),
        Some("number") => trimmed
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(trimmed.to_string())),
        _ => guess_scalar(trimmed),
    }
}

/// Untyped fallback: guess string/number/boolean from the literal's shape.
/// Used for fields with no declared schema type (e.g. `schema` is `None`,
/// or the field isn't declared).
fn guess_scalar(trimmed: &str) -> Value {
    if trimmed.is_empty() {
        return Value::String(String::new());
    }
    if let Ok(b) = trimmed.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(trimmed.to_string())
}

/// Split a full assistant utterance into thinking text, the first tool
/// block (verbatim, tags included), and the remaining text after it.
pub fn split_utterance(text: &str) -> SplitUtterance<'_> {
    match find_tool_block(text) {
        Some((start, end)) => SplitUtterance {
            thinking: if start > 0 { Some(&text[..start]) } else { None },
            tool_block: Some(&text[start..end]),
            remaining: &text[end..],
        },
        None => SplitUtterance {
            thinking: None,
            tool_block: None,
            remaining: text,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_happy_path() {
        let block = "<tool><tool_name>converse</tool_name><arguments><message>Hi there!</message></arguments></tool>";
        let call = parse_tool_call(block).unwrap();
        assert_eq!(call.server_name, "local");
        assert_eq!(call.tool_name, "converse");
        let args = decode_arguments(&call.arguments_xml, None).unwrap();
        assert_eq!(args["message"], "Hi there!");
    }

    #[test]
    fn parses_explicit_server_name() {
        let block = "<tool><server_name>remote</server_name><tool_name>ping</tool_name><arguments></arguments></tool>";
        let call = parse_tool_call(block).unwrap();
        assert_eq!(call.server_name, "remote");
    }

    #[test]
    fn missing_tool_name_is_malformed() {
        let block = "<tool><arguments></arguments></tool>";
        assert!(parse_tool_call(block).is_err());
    }

    #[test]
    fn decodes_repeated_children_as_array() {
        let xml = "<suggestions><item>a</item><item>b</item><item>c</item></suggestions>";
        let value = decode_arguments(xml, None).unwrap();
        assert_eq!(value["suggestions"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn decodes_cdata_scalar() {
        let xml = "<result><![CDATA[has <angle> brackets & stuff]]></result>";
        let value = decode_arguments(xml, None).unwrap();
        assert_eq!(value["result"], "has <angle> brackets & stuff");
    }

    #[test]
    fn schema_typed_string_field_is_never_coerced() {
        // A numeric- or boolean-looking literal in a schema-declared string
        // field must stay a string, not be promoted to Number/Bool.
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "message": {"type": "string"},
                "result": {"type": "string"}
            }
        });
        let message_value = decode_arguments("<message>42</message>", Some(&schema)).unwrap();
        assert_eq!(message_value["message"], "42");
        assert!(message_value["message"].is_string());

        let result_value = decode_arguments("<result>true</result>", Some(&schema)).unwrap();
        assert_eq!(result_value["result"], "true");
        assert!(result_value["result"].is_string());
    }

    #[test]
    fn schema_typed_array_items_use_declared_item_type() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "counts": {"type": "array", "items": {"type": "integer"}}
            }
        });
        let xml = "<counts><item>1</item><item>2</item></counts>";
        let value = decode_arguments(xml, Some(&schema)).unwrap();
        let arr = value["counts"].as_array().unwrap();
        assert_eq!(arr[0], 1);
        assert_eq!(arr[1], 2);
    }

    #[test]
    fn untyped_field_without_schema_still_guesses() {
        let value = decode_arguments("<flag>true</flag>", None).unwrap();
        assert_eq!(value["flag"], true);
    }

    #[test]
    fn cdata_ampersand_is_not_double_escaped() {
        let xml = "<message><![CDATA[Tom & Jerry]]></message>";
        let normalized = normalize_ampersands(xml);
        assert!(normalized.contains("Tom & Jerry"));
        assert!(!normalized.contains("&amp;"));
    }

    #[test]
    fn normalizes_bare_ampersand() {
        let input = "Tom & Jerry &amp; friends &#65;";
        let out = normalize_ampersands(input);
        assert_eq!(out, "Tom &amp; Jerry &amp; friends &#65;");
    }

    #[test]
    fn early_detect_resolves_before_close() {
        let partial = "<tool><tool_name>read_file</tool_name><arguments><path>";
        assert_eq!(early_detect_tool_name(partial), Some("read_file".to_string()));
    }

    #[test]
    fn early_detect_none_before_tag_closes() {
        let partial = "<tool><tool_name>read_fi";
        assert_eq!(early_detect_tool_name(partial), None);
    }

    #[test]
    fn split_utterance_separates_thinking_and_remaining() {
        let text = "Let me check.<tool><tool_name>x</tool_name><arguments></arguments></tool> done.";
        let split = split_utterance(text);
        assert_eq!(split.thinking, Some("Let me check."));
        assert!(split.tool_block.unwrap().starts_with("<tool>"));
        assert_eq!(split.remaining, " done.");
    }

    #[test]
    fn only_first_block_is_found() {
        let text = "<tool><tool_name>a</tool_name><arguments></arguments></tool><tool><tool_name>b</tool_name><arguments></arguments></tool>";
        let (start, end) = find_tool_block(text).unwrap();
        let call = parse_tool_call(&text[start..end]).unwrap();
        assert_eq!(call.tool_name, "a");
    }
}
