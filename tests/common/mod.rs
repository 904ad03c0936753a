//! Common test helpers and fixtures shared across the test suite.

#![allow(dead_code)]

use cds_migrator::{DumpRecord, FileDescriptor, Revision};

fn escape(value: &str) -> String {
    value.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// A `<controlfield>` element.
pub fn controlfield(tag: &str, value: &str) -> String {
    format!(r#"<controlfield tag="{tag}">{}</controlfield>"#, escape(value))
}

/// A `<datafield>` element; `' '` indicators are written as blanks.
pub fn datafield(tag: &str, ind1: char, ind2: char, subfields: &[(char, &str)]) -> String {
    let inner: String = subfields
        .iter()
        .map(|(code, value)| format!(r#"<subfield code="{code}">{}</subfield>"#, escape(value)))
        .collect();
    format!(r#"<datafield tag="{tag}" ind1="{ind1}" ind2="{ind2}">{inner}</datafield>"#)
}

/// Wrap fields into a namespaced MARCXML `<record>`.
pub fn marcxml(fields: &[String]) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<record xmlns="http://www.loc.gov/MARC21/slim">{}</record>"#
        ),
        fields.concat()
    )
}

/// A revision modified at `timestamp`.
pub fn revision(timestamp: &str, fields: &[String]) -> Revision {
    Revision {
        modification_timestamp: timestamp.to_string(),
        raw_marc_payload: marcxml(fields),
    }
}

/// A dump record with one revision and no files.
pub fn dump_record(id: &str, fields: &[String]) -> DumpRecord {
    DumpRecord::new(id, vec![revision("2021-06-01 12:00:00", fields)], Vec::new())
        .expect("fixture record has a revision")
}

/// A file descriptor with a checksum derived from its name and version.
pub fn file(name: &str, version: u32, created: &str) -> FileDescriptor {
    FileDescriptor {
        name: name.to_string(),
        version_number: version,
        creation_timestamp: Some(created.to_string()),
        checksum: Some(format!("md5:{name}-{version}")),
        restriction_marker: None,
        storage_path: Some(format!("/opt/cds/files/{name};{version}")),
        size: Some(1024),
    }
}

/// Fields of a clean article by `Doe, Jane` with one contributor.
pub fn article_fields(id: &str) -> Vec<String> {
    vec![
        controlfield("001", id),
        controlfield("005", "20210601120000.0"),
        datafield("041", ' ', ' ', &[('a', "eng")]),
        datafield("100", ' ', ' ', &[('a', "Doe, Jane"), ('u', "CERN")]),
        datafield("245", ' ', ' ', &[('a', &format!("Measurement {id}"))]),
        datafield("269", ' ', ' ', &[('c', "2021-05-30")]),
        datafield("520", ' ', ' ', &[('a', "An abstract.")]),
        datafield("700", ' ', ' ', &[('a', "Roe, Richard"), ('e', "Editor")]),
        datafield("980", ' ', ' ', &[('a', "ARTICLE")]),
    ]
}

/// A clean article dump record.
pub fn article(id: &str) -> DumpRecord {
    dump_record(id, &article_fields(id))
}

/// An article with an extra tag that no rule handles.
pub fn lossy_article(id: &str) -> DumpRecord {
    let mut fields = article_fields(id);
    fields.push(datafield("999", 'C', '5', &[('x', "citation")]));
    dump_record(id, &fields)
}
