//! MARCXML parsing of revision payloads.
//!
//! Each revision in a legacy dump embeds its MARC data as a MARCXML
//! `<record>` string. This module deserializes that payload with
//! `quick-xml` and folds it into a [`MarcBlob`] keyed by tag plus indicators.
//!
//! Both default-namespace (`<record xmlns="...">`) and prefix-namespace
//! (`<marc:record xmlns:marc="...">`) forms are accepted, as well as bare
//! `<record>` elements and a `<collection>` holding exactly one record.
//! Legacy payloads frequently omit the leader, so it is optional here.
//!
//! # Examples
//!
//! ```ignore
//! use cds_migrator::marcxml;
//!
//! let blob = marcxml::parse_revision_payload(
//!     r#"<record><datafield tag="100" ind1=" " ind2=" ">
//!          <subfield code="a">Doe, Jane</subfield>
//!        </datafield></record>"#,
//! )?;
//! assert_eq!(blob.subfield_values("100__", 'a').next(), Some("Doe, Jane"));
//! # Ok::<(), cds_migrator::MigrationError>(())
//! ```

use lazy_static::lazy_static;
use quick_xml::de::from_str as xml_from_str;
use quick_xml::se::to_string as xml_to_string;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MigrationError, Result};
use crate::record::{MarcBlob, Occurrence};

/// The MARCXML namespace URI.
const MARCXML_NS: &str = "http://www.loc.gov/MARC21/slim";

lazy_static! {
    static ref XMLNS_DECL: Regex = Regex::new(r#"\s+xmlns(?::\w+)?="[^"]*""#).unwrap();
    static ref NS_PREFIX: Regex = Regex::new(r"<(/?)(\w+):").unwrap();
    static ref XML_DECL: Regex = Regex::new(r"^\s*<\?xml[^>]*\?>").unwrap();
}

/// MARCXML record representation.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "record")]
struct MarcxmlRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    leader: Option<String>,
    #[serde(default)]
    controlfield: Vec<MarcxmlControlField>,
    #[serde(default)]
    datafield: Vec<MarcxmlDataField>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MarcxmlControlField {
    #[serde(rename = "@tag")]
    tag: String,
    #[serde(rename = "$value", default)]
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MarcxmlDataField {
    #[serde(rename = "@tag")]
    tag: String,
    #[serde(rename = "@ind1", default)]
    ind1: String,
    #[serde(rename = "@ind2", default)]
    ind2: String,
    #[serde(default)]
    subfield: Vec<MarcxmlSubfield>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MarcxmlSubfield {
    #[serde(rename = "@code")]
    code: String,
    #[serde(rename = "$value", default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "collection")]
struct MarcxmlCollection {
    #[serde(default, rename = "record")]
    records: Vec<MarcxmlRecord>,
}

/// Strip XML namespace prefixes and declarations from MARCXML input.
fn strip_marcxml_ns(xml: &str) -> String {
    let without_decl = XML_DECL.replace(xml, "");
    let stripped = XMLNS_DECL.replace_all(&without_decl, "");
    NS_PREFIX.replace_all(&stripped, "<$1").to_string()
}

/// Parse one revision's MARCXML payload into a [`MarcBlob`].
///
/// # Errors
///
/// Returns [`MigrationError::InvalidMarc`] if the XML is malformed, a
/// datafield has an empty subfield code, or a collection does not hold
/// exactly one record.
pub fn parse_revision_payload(xml: &str) -> Result<MarcBlob> {
    let cleaned = strip_marcxml_ns(xml);
    let trimmed = cleaned.trim_start();

    let xml_record = if trimmed.starts_with("<collection") {
        let collection: MarcxmlCollection = xml_from_str(trimmed)
            .map_err(|e| MigrationError::InvalidMarc(format!("Failed to parse collection: {e}")))?;
        let mut records = collection.records;
        if records.len() != 1 {
            return Err(MigrationError::InvalidMarc(format!(
                "Expected exactly one record in collection, found {}",
                records.len()
            )));
        }
        records.remove(0)
    } else {
        xml_from_str(trimmed)
            .map_err(|e| MigrationError::InvalidMarc(format!("Failed to parse MARCXML: {e}")))?
    };

    marcxml_record_to_blob(xml_record)
}

fn marcxml_record_to_blob(xml_record: MarcxmlRecord) -> Result<MarcBlob> {
    let mut blob = MarcBlob::new();
    blob.leader = xml_record.leader;

    for cf in xml_record.controlfield {
        blob.add_control(cf.tag.trim(), cf.value);
    }

    for df in xml_record.datafield {
        let ind1 = df.ind1.chars().next().unwrap_or(' ');
        let ind2 = df.ind2.chars().next().unwrap_or(' ');

        let mut subfields = crate::record::SubfieldMap::new();
        for sf in df.subfield {
            let code = sf.code.chars().next().ok_or_else(|| {
                MigrationError::InvalidMarc(format!("Missing subfield code in tag {}", df.tag))
            })?;
            subfields.push(code, sf.value);
        }

        blob.add_data(df.tag.trim(), ind1, ind2, subfields);
    }

    Ok(blob)
}

/// Render a [`MarcBlob`] back to a MARCXML `<record>` string.
///
/// Used to embed source snippets in previews and to build test payloads.
/// Tag keys are split back into tag and indicators (`_` becomes blank).
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn blob_to_marcxml(blob: &MarcBlob) -> Result<String> {
    let mut controlfield = Vec::new();
    let mut datafield = Vec::new();

    for (key, occurrences) in blob.iter() {
        for occurrence in occurrences {
            match occurrence {
                Occurrence::Control(value) => controlfield.push(MarcxmlControlField {
                    tag: key.to_string(),
                    value: value.clone(),
                }),
                Occurrence::Data(map) => {
                    let (tag, ind1, ind2) = split_key(key);
                    let subfield = map
                        .iter()
                        .flat_map(|(code, value)| {
                            value.values().map(move |v| MarcxmlSubfield {
                                code: code.to_string(),
                                value: v.to_string(),
                            })
                        })
                        .collect();
                    datafield.push(MarcxmlDataField {
                        tag,
                        ind1,
                        ind2,
                        subfield,
                    });
                },
            }
        }
    }

    let xml_record = MarcxmlRecord {
        leader: blob.leader.clone(),
        controlfield,
        datafield,
    };

    let body = xml_to_string(&xml_record)
        .map_err(|e| MigrationError::InvalidMarc(format!("Failed to serialize to MARCXML: {e}")))?;

    Ok(body.replacen("<record>", &format!("<record xmlns=\"{MARCXML_NS}\">"), 1))
}

fn split_key(key: &str) -> (String, String, String) {
    let mut chars = key.chars();
    let tag: String = chars.by_ref().take(3).collect();
    let indicator = |c: Option<char>| match c {
        Some('_') | None => " ".to_string(),
        Some(c) => c.to_string(),
    };
    let ind1 = indicator(chars.next());
    let ind2 = indicator(chars.next());
    (tag, ind1, ind2)
}
