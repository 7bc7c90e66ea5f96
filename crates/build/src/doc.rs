//! Parser for the build-description document format.
//!
//! The format is a small indentation-structured mapping language (a YAML
//! subset): a root mapping of sections, nested mappings of `key: value`
//! entries, and values that are scalars, flow lists (`[a, b]`), or block
//! lists (`- item` lines). `#` starts a comment line; scalars and list
//! items may be quoted.
//!
//! Every parsed node carries its byte span in the source buffer so the
//! loader can point diagnostics at the offending text.

use std::fmt;

use thiserror::Error;

/// Byte range in the source buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
  pub offset: usize,
  pub len: usize,
}

impl Span {
  pub fn new(offset: usize, len: usize) -> Span {
    Span { offset, len }
  }
}

impl fmt::Display for Span {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "offset {}", self.offset)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spanned<T> {
  pub value: T,
  pub span: Span,
}

impl<T> Spanned<T> {
  fn new(value: T, span: Span) -> Spanned<T> {
    Spanned { value, span }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocValue {
  Scalar(Spanned<String>),
  List(Vec<Spanned<String>>),
  Map(Vec<DocEntry>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocEntry {
  pub key: Spanned<String>,
  pub value: DocValue,
}

/// A parsed document: the root mapping, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
  pub root: Vec<DocEntry>,
}

#[derive(Debug, Error)]
#[error("{message} at {span}")]
pub struct DocError {
  pub message: String,
  pub span: Span,
}

impl DocError {
  fn new(message: impl Into<String>, span: Span) -> DocError {
    DocError {
      message: message.into(),
      span,
    }
  }
}

/// One significant source line.
#[derive(Clone, Copy)]
struct Line<'a> {
  indent: usize,
  /// Byte offset of the first non-indentation character.
  offset: usize,
  text: &'a str,
}

fn scan_lines(source: &str) -> Result<Vec<Line<'_>>, DocError> {
  let mut lines = Vec::new();
  let mut pos = 0;

  for raw in source.split('\n') {
    let line_start = pos;
    pos += raw.len() + 1;
    let line = raw.strip_suffix('\r').unwrap_or(raw);

    let bytes = line.as_bytes();
    let mut indent = 0;
    while indent < bytes.len() && bytes[indent] == b' ' {
      indent += 1;
    }
    if indent < bytes.len() && bytes[indent] == b'\t' {
      return Err(DocError::new(
        "tab in indentation",
        Span::new(line_start + indent, 1),
      ));
    }

    let text = line[indent..].trim_end();
    if text.is_empty() || text.starts_with('#') {
      continue;
    }
    lines.push(Line {
      indent,
      offset: line_start + indent,
      text,
    });
  }

  Ok(lines)
}

pub fn parse_document(source: &str) -> Result<Document, DocError> {
  let lines = scan_lines(source)?;
  let mut pos = 0;
  let root = parse_map(&lines, &mut pos, 0)?;
  Ok(Document { root })
}

fn parse_map(lines: &[Line<'_>], pos: &mut usize, indent: usize) -> Result<Vec<DocEntry>, DocError> {
  let mut entries = Vec::new();

  while *pos < lines.len() {
    let line = lines[*pos];
    if line.indent < indent {
      break;
    }
    if line.indent > indent {
      return Err(DocError::new(
        "unexpected indentation",
        Span::new(line.offset, line.text.len()),
      ));
    }
    if line.text.starts_with('-') {
      return Err(DocError::new(
        "list item outside a list value",
        Span::new(line.offset, line.text.len()),
      ));
    }

    let (key, rest) = parse_key(line)?;
    *pos += 1;

    let value = match rest {
      Some((rest_offset, rest_text)) => parse_inline_value(rest_offset, rest_text)?,
      None => {
        if *pos < lines.len() && lines[*pos].indent > indent {
          let child_indent = lines[*pos].indent;
          if lines[*pos].text.starts_with('-') {
            parse_block_list(lines, pos, child_indent)?
          } else {
            DocValue::Map(parse_map(lines, pos, child_indent)?)
          }
        } else {
          DocValue::Map(Vec::new())
        }
      }
    };

    entries.push(DocEntry { key, value });
  }

  Ok(entries)
}

/// Split `key: rest`, honouring a quoted key. Returns the key and, if the
/// line carried an inline value, its offset and text.
fn parse_key<'a>(line: Line<'a>) -> Result<(Spanned<String>, Option<(usize, &'a str)>), DocError> {
  let text = line.text;

  let (key, key_span, colon_idx) = if let Some(stripped) = text.strip_prefix('"') {
    let Some(end) = stripped.find('"') else {
      return Err(DocError::new(
        "unterminated quoted key",
        Span::new(line.offset, text.len()),
      ));
    };
    let after = &text[end + 2..];
    let Some(colon_in_after) = after.find(':') else {
      return Err(DocError::new(
        "expected ':' after mapping key",
        Span::new(line.offset, text.len()),
      ));
    };
    if !after[..colon_in_after].trim().is_empty() {
      return Err(DocError::new(
        "unexpected text between key and ':'",
        Span::new(line.offset + end + 2, colon_in_after),
      ));
    }
    (
      stripped[..end].to_string(),
      Span::new(line.offset, end + 2),
      end + 2 + colon_in_after,
    )
  } else {
    let Some(colon_idx) = text.find(':') else {
      return Err(DocError::new(
        "expected ':' after mapping key",
        Span::new(line.offset, text.len()),
      ));
    };
    let key_text = text[..colon_idx].trim_end();
    if key_text.is_empty() {
      return Err(DocError::new(
        "expected mapping key",
        Span::new(line.offset, 1),
      ));
    }
    (
      key_text.to_string(),
      Span::new(line.offset, key_text.len()),
      colon_idx,
    )
  };

  let after_colon = &text[colon_idx + 1..];
  let leading_ws = after_colon.len() - after_colon.trim_start().len();
  let rest_text = after_colon.trim_start();
  let rest = if rest_text.is_empty() {
    None
  } else {
    Some((line.offset + colon_idx + 1 + leading_ws, rest_text))
  };

  Ok((Spanned::new(key, key_span), rest))
}

fn parse_inline_value(offset: usize, text: &str) -> Result<DocValue, DocError> {
  if text.starts_with('{') {
    if text == "{}" {
      return Ok(DocValue::Map(Vec::new()));
    }
    return Err(DocError::new(
      "flow mappings other than '{}' are not supported",
      Span::new(offset, text.len()),
    ));
  }
  if let Some(inner) = text.strip_prefix('[') {
    let Some(inner) = inner.strip_suffix(']') else {
      return Err(DocError::new(
        "unterminated flow list",
        Span::new(offset, text.len()),
      ));
    };
    let inner_offset = offset + 1;

    let mut items = Vec::new();
    let mut start = 0;
    let mut in_quote: Option<char> = None;
    for (i, c) in inner.char_indices() {
      match (in_quote, c) {
        (Some(quote), _) if c == quote => in_quote = None,
        (Some(_), _) => {}
        (None, '"') | (None, '\'') => in_quote = Some(c),
        (None, ',') => {
          push_list_item(&mut items, &inner[start..i], inner_offset + start);
          start = i + 1;
        }
        (None, _) => {}
      }
    }
    if in_quote.is_some() {
      return Err(DocError::new(
        "unterminated quote in flow list",
        Span::new(offset, text.len()),
      ));
    }
    push_list_item(&mut items, &inner[start..], inner_offset + start);

    return Ok(DocValue::List(items));
  }

  Ok(DocValue::Scalar(unquote(text, offset)))
}

fn parse_block_list(lines: &[Line<'_>], pos: &mut usize, indent: usize) -> Result<DocValue, DocError> {
  let mut items = Vec::new();

  while *pos < lines.len() && lines[*pos].indent == indent && lines[*pos].text.starts_with('-') {
    let line = lines[*pos];
    let after = &line.text[1..];
    let leading_ws = after.len() - after.trim_start().len();
    let item = after.trim_start();
    if item.is_empty() {
      return Err(DocError::new(
        "empty list item",
        Span::new(line.offset, line.text.len()),
      ));
    }
    items.push(unquote(item, line.offset + 1 + leading_ws));
    *pos += 1;
  }

  if *pos < lines.len() && lines[*pos].indent > indent {
    let line = lines[*pos];
    return Err(DocError::new(
      "unexpected indentation",
      Span::new(line.offset, line.text.len()),
    ));
  }

  Ok(DocValue::List(items))
}

fn push_list_item(items: &mut Vec<Spanned<String>>, text: &str, offset: usize) {
  let leading_ws = text.len() - text.trim_start().len();
  let trimmed = text.trim();
  if trimmed.is_empty() {
    return;
  }
  items.push(unquote(trimmed, offset + leading_ws));
}

/// Strip one layer of matching quotes; the span covers the quoted text.
fn unquote(text: &str, offset: usize) -> Spanned<String> {
  let span = Span::new(offset, text.len());
  for quote in ['"', '\''] {
    if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
      return Spanned::new(text[1..text.len() - 1].to_string(), span);
    }
  }
  Spanned::new(text.to_string(), span)
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = "\
# a build description
client:
  name: kiln
  version: 1
targets:
  all: [out.txt, <group>]
commands:
  copy:
    tool: shell
    inputs:
      - in.txt
    outputs: [out.txt]
    args: cp in.txt out.txt
    description: \"COPY in.txt -> out.txt\"
";

  fn scalar(value: &DocValue) -> &str {
    match value {
      DocValue::Scalar(s) => &s.value,
      other => panic!("expected scalar, got {other:?}"),
    }
  }

  fn map(value: &DocValue) -> &[DocEntry] {
    match value {
      DocValue::Map(entries) => entries,
      other => panic!("expected map, got {other:?}"),
    }
  }

  fn list(value: &DocValue) -> Vec<&str> {
    match value {
      DocValue::List(items) => items.iter().map(|i| i.value.as_str()).collect(),
      other => panic!("expected list, got {other:?}"),
    }
  }

  #[test]
  fn parses_sections_in_order() {
    let doc = parse_document(SAMPLE).unwrap();
    let names: Vec<&str> = doc.root.iter().map(|e| e.key.value.as_str()).collect();
    assert_eq!(names, ["client", "targets", "commands"]);
  }

  #[test]
  fn scalars_lists_and_nested_maps() {
    let doc = parse_document(SAMPLE).unwrap();

    let client = map(&doc.root[0].value);
    assert_eq!(client[0].key.value, "name");
    assert_eq!(scalar(&client[0].value), "kiln");
    assert_eq!(scalar(&client[1].value), "1");

    let targets = map(&doc.root[1].value);
    assert_eq!(targets[0].key.value, "all");
    assert_eq!(list(&targets[0].value), ["out.txt", "<group>"]);

    let commands = map(&doc.root[2].value);
    let copy = map(&commands[0].value);
    assert_eq!(copy[0].key.value, "tool");
    assert_eq!(list(&copy[1].value), ["in.txt"]);
    assert_eq!(list(&copy[2].value), ["out.txt"]);
    assert_eq!(scalar(&copy[3].value), "cp in.txt out.txt");
    assert_eq!(scalar(&copy[4].value), "COPY in.txt -> out.txt");
  }

  #[test]
  fn spans_point_into_the_source() {
    let doc = parse_document(SAMPLE).unwrap();
    let client = map(&doc.root[0].value);
    let version = &client[1];
    assert_eq!(&SAMPLE[version.key.span.offset..][..version.key.span.len], "version");

    let commands = map(&doc.root[2].value);
    let copy = map(&commands[0].value);
    let args = &copy[3];
    match &args.value {
      DocValue::Scalar(s) => {
        assert_eq!(&SAMPLE[s.span.offset..][..s.span.len], "cp in.txt out.txt");
      }
      other => panic!("expected scalar, got {other:?}"),
    }
  }

  #[test]
  fn quoted_scalars_and_items() {
    let doc = parse_document("section:\n  key: 'a b'\n  items: [\"x, y\", z]\n").unwrap();
    let section = map(&doc.root[0].value);
    assert_eq!(scalar(&section[0].value), "a b");
    assert_eq!(list(&section[1].value), ["x, y", "z"]);
  }

  #[test]
  fn empty_section_is_an_empty_map() {
    let doc = parse_document("nodes:\ncommands:\n").unwrap();
    assert_eq!(doc.root[0].value, DocValue::Map(Vec::new()));
    assert_eq!(doc.root[1].value, DocValue::Map(Vec::new()));

    let doc = parse_document("nodes: {}\n").unwrap();
    assert_eq!(doc.root[0].value, DocValue::Map(Vec::new()));
  }

  #[test]
  fn missing_colon_is_an_error() {
    let err = parse_document("client\n").unwrap_err();
    assert!(err.message.contains("expected ':'"), "{err}");
    assert_eq!(err.span.offset, 0);
  }

  #[test]
  fn tab_indentation_is_an_error() {
    let err = parse_document("client:\n\tname: x\n").unwrap_err();
    assert!(err.message.contains("tab"), "{err}");
  }

  #[test]
  fn over_indented_line_is_an_error() {
    let err = parse_document("a:\n  b: 1\n    c: 2\n").unwrap_err();
    assert!(err.message.contains("indentation"), "{err}");
  }

  #[test]
  fn unterminated_flow_list_is_an_error() {
    let err = parse_document("a:\n  b: [one, two\n").unwrap_err();
    assert!(err.message.contains("unterminated flow list"), "{err}");
  }
}
