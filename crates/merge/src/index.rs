//! Version index documents (`maven-metadata.xml`).
//!
//! Only the parts that take part in a merge are modelled: the coordinates and
//! the `<versioning>` block. Anything else in the document is skipped when
//! parsing and is not rendered back out.

use exn::ResultExt;
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;

use crate::error::{ErrorKind, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Versioning {
    pub latest: Option<String>,
    pub release: Option<String>,
    pub versions: Vec<String>,
    /// `yyyyMMddHHmmss`, UTC.
    pub last_updated: Option<String>,
}
impl Versioning {
    fn is_empty(&self) -> bool {
        self.latest.is_none() && self.release.is_none() && self.versions.is_empty() && self.last_updated.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionIndex {
    pub group_id: Option<String>,
    pub artifact_id: Option<String>,
    pub version: Option<String>,
    pub versioning: Versioning,
}

impl VersionIndex {
    /// Parse a version index. `origin` names the document's source in errors.
    pub fn parse(bytes: &[u8], origin: &str) -> Result<Self> {
        let malformed = |reason: String| ErrorKind::MalformedDocument { store: origin.to_string(), reason };
        let text = std::str::from_utf8(bytes).or_raise(|| malformed("not valid UTF-8".to_string()))?;
        let mut reader = Reader::from_str(text);
        let mut index = Self::default();
        let mut stack: Vec<String> = Vec::new();
        let mut saw_root = false;
        loop {
            let event = reader.read_event().or_raise(|| malformed(format!("invalid XML at byte {}", reader.buffer_position())))?;
            match event {
                Event::Start(start) => {
                    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                    if stack.is_empty() {
                        if name != "metadata" {
                            exn::bail!(malformed(format!("unexpected root element <{name}>")));
                        }
                        saw_root = true;
                    }
                    stack.push(name);
                },
                Event::End(_) => {
                    stack.pop();
                },
                Event::Empty(empty) if stack.is_empty() => {
                    if empty.name().as_ref() != b"metadata" {
                        exn::bail!(malformed("unexpected root element".to_string()));
                    }
                    saw_root = true;
                },
                Event::Text(text) => {
                    let value = text.unescape().or_raise(|| malformed("invalid character reference".to_string()))?;
                    let value = value.trim();
                    if !value.is_empty() {
                        index.assign(&stack, value.to_string());
                    }
                },
                Event::Eof => {
                    if let Some(open) = stack.last() {
                        exn::bail!(malformed(format!("unclosed <{open}> at end of document")));
                    }
                    break;
                },
                _ => {},
            }
        }
        if !saw_root {
            exn::bail!(malformed("missing <metadata> element".to_string()));
        }
        Ok(index)
    }

    fn assign(&mut self, stack: &[String], value: String) {
        let path: Vec<&str> = stack.iter().map(String::as_str).collect();
        match path.as_slice() {
            ["metadata", "groupId"] => self.group_id = Some(value),
            ["metadata", "artifactId"] => self.artifact_id = Some(value),
            ["metadata", "version"] => self.version = Some(value),
            ["metadata", "versioning", "latest"] => self.versioning.latest = Some(value),
            ["metadata", "versioning", "release"] => self.versioning.release = Some(value),
            ["metadata", "versioning", "lastUpdated"] => self.versioning.last_updated = Some(value),
            ["metadata", "versioning", "versions", "version"] => self.versioning.versions.push(value),
            _ => {},
        }
    }

    /// Render with an XML declaration, two-space indentation and a trailing
    /// newline. Absent fields are left out.
    pub fn render(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<metadata>\n");
        push_element(&mut out, 1, "groupId", self.group_id.as_deref());
        push_element(&mut out, 1, "artifactId", self.artifact_id.as_deref());
        push_element(&mut out, 1, "version", self.version.as_deref());
        let versioning = &self.versioning;
        if !versioning.is_empty() {
            out.push_str("  <versioning>\n");
            push_element(&mut out, 2, "latest", versioning.latest.as_deref());
            push_element(&mut out, 2, "release", versioning.release.as_deref());
            if !versioning.versions.is_empty() {
                out.push_str("    <versions>\n");
                for version in &versioning.versions {
                    push_element(&mut out, 3, "version", Some(version));
                }
                out.push_str("    </versions>\n");
            }
            push_element(&mut out, 2, "lastUpdated", versioning.last_updated.as_deref());
            out.push_str("  </versioning>\n");
        }
        out.push_str("</metadata>\n");
        out
    }
}

fn push_element(out: &mut String, depth: usize, name: &str, value: Option<&str>) {
    let Some(value) = value else {
        return;
    };
    out.push_str(&"  ".repeat(depth));
    out.push_str(&format!("<{name}>{}</{name}>\n", escape(value)));
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
        <metadata>\n\
        \x20 <groupId>org.foo</groupId>\n\
        \x20 <artifactId>bar</artifactId>\n\
        \x20 <versioning>\n\
        \x20   <latest>1.1</latest>\n\
        \x20   <release>1.1</release>\n\
        \x20   <versions>\n\
        \x20     <version>1.0</version>\n\
        \x20     <version>1.1</version>\n\
        \x20   </versions>\n\
        \x20   <lastUpdated>20150822164334</lastUpdated>\n\
        \x20 </versioning>\n\
        </metadata>\n";

    #[test]
    fn test_parse() {
        let index = VersionIndex::parse(DOCUMENT.as_bytes(), "test").unwrap();
        assert_eq!(index.group_id.as_deref(), Some("org.foo"));
        assert_eq!(index.artifact_id.as_deref(), Some("bar"));
        assert_eq!(index.version, None);
        assert_eq!(index.versioning.latest.as_deref(), Some("1.1"));
        assert_eq!(index.versioning.versions, ["1.0", "1.1"]);
        assert_eq!(index.versioning.last_updated.as_deref(), Some("20150822164334"));
    }

    #[test]
    fn test_render_is_stable() {
        let index = VersionIndex::parse(DOCUMENT.as_bytes(), "test").unwrap();
        assert_eq!(index.render(), DOCUMENT);
    }

    #[test]
    fn test_unknown_elements_are_skipped() {
        let xml = "<metadata><groupId>g</groupId><plugins><plugin><name>x</name></plugin></plugins>\
                   <versioning><snapshot><timestamp>1</timestamp></snapshot><versions/></versioning></metadata>";
        let index = VersionIndex::parse(xml.as_bytes(), "test").unwrap();
        assert_eq!(index.group_id.as_deref(), Some("g"));
        assert!(index.versioning.is_empty());
    }

    #[test]
    fn test_escaping() {
        let index = VersionIndex { group_id: Some("a&b".to_string()), ..Default::default() };
        let rendered = index.render();
        assert!(rendered.contains("<groupId>a&amp;b</groupId>"));
        assert_eq!(VersionIndex::parse(rendered.as_bytes(), "test").unwrap(), index);
    }

    #[test]
    fn test_rejects_other_documents() {
        let err = VersionIndex::parse(b"<project><version>1</version></project>", "remote:central").unwrap_err();
        assert!(matches!(&*err, ErrorKind::MalformedDocument { store, .. } if store == "remote:central"));
        assert!(VersionIndex::parse(b"not xml at all", "test").is_err());
        assert!(VersionIndex::parse(b"<metadata><groupId>g</metadata>", "test").is_err());
        assert!(VersionIndex::parse(&[0xff, 0xfe], "test").is_err());
    }

    #[test]
    fn test_rejects_truncated_document() {
        let truncated = b"<metadata>\n  <versioning>\n    <versions>\n      <version>1.0</version>\n";
        let err = VersionIndex::parse(truncated, "remote:flaky").unwrap_err();
        assert!(matches!(&*err, ErrorKind::MalformedDocument { reason, .. } if reason.contains("<versions>")));
    }
}
