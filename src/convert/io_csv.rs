// Primitives for reading delimited text files.

use std::collections::BTreeMap;
use std::fs;

use crate::convert::io_common::{input_digest, simplify_file_name, strip_bom};
use crate::convert::*;

const DELIMITERS: [u8; 3] = [b',', b';', b'\t'];

/// Picks the delimiter that splits the header line the most. Comma wins ties.
pub fn sniff_delimiter(bytes: &[u8]) -> u8 {
    let header = bytes.split(|b| *b == b'\n').next().unwrap_or(&[]);
    let mut best = b',';
    let mut best_count = 0;
    for d in DELIMITERS {
        let count = header.iter().filter(|b| **b == d).count();
        if count > best_count {
            best = d;
            best_count = count;
        }
    }
    best
}

// Returns the digest of the raw bytes and the records, the header included.
fn read_records(path: &str, delimiter: Option<u8>) -> ConvertResult<(String, Vec<Vec<String>>)> {
    let bytes = fs::read(path).context(OpeningFileSnafu { path })?;
    let digest = input_digest(&bytes);
    let content = strip_bom(&bytes);
    let delimiter = delimiter.unwrap_or_else(|| sniff_delimiter(content));
    debug!(
        "read_records: path: {:?} delimiter: {:?}",
        path, delimiter as char
    );
    let rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(content);
    let mut res: Vec<Vec<String>> = Vec::new();
    for (idx, line_r) in rdr.into_records().enumerate() {
        let lineno = idx + 1;
        let line = line_r.context(CsvLineParseSnafu { path, lineno })?;
        res.push(line.iter().map(|s| s.to_string()).collect());
    }
    Ok((digest, res))
}

/// Reads a delimited file whose first line holds the column names.
pub fn read_csv_table(path: &str, delimiter: Option<u8>) -> ConvertResult<InputTable> {
    let (digest, mut records) = read_records(path, delimiter)?;
    if records.is_empty() {
        return EmptyInputSnafu { path }.fail();
    }
    let headers = records.remove(0);
    let expected = headers.len();
    for (idx, r) in records.iter().enumerate() {
        if r.len() > expected {
            return CsvLineTooLongSnafu {
                path,
                lineno: idx + 2,
                found: r.len(),
                expected,
            }
            .fail();
        }
    }
    info!(
        "read_csv_table: {}: {} columns, {} rows",
        path,
        expected,
        records.len()
    );
    Ok(InputTable::new(
        &simplify_file_name(path),
        &digest,
        &headers,
        records,
    ))
}

/// Reads a two-column identifier table: external identifier, local identifier.
///
/// The first line is a header. Lines with an empty external identifier are
/// skipped.
pub fn read_id_map(path: &str) -> ConvertResult<BTreeMap<String, String>> {
    let (_, records) = read_records(path, None)?;
    let mut res: BTreeMap<String, String> = BTreeMap::new();
    for (idx, r) in records.iter().enumerate().skip(1) {
        let lineno = idx + 1;
        let (external, local) = match r.as_slice() {
            [e, l, ..] => (e.trim(), l.trim()),
            [e] if e.trim().is_empty() => continue,
            _ => return CsvLineTooShortSnafu { path, lineno }.fail(),
        };
        if external.is_empty() {
            continue;
        }
        if let Some(previous) = res.insert(external.to_string(), local.to_string()) {
            warn!(
                "read_id_map: {}: line {}: {} was already mapped to {}",
                path, lineno, external, previous
            );
        }
    }
    info!("read_id_map: {}: {} identifiers", path, res.len());
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> String {
        let p = dir.path().join(name);
        fs::write(&p, content).unwrap();
        p.display().to_string()
    }

    #[test]
    fn delimiters() {
        assert_eq!(sniff_delimiter(b"ID;WB01;WB02\n1,5;2;3"), b';');
        assert_eq!(sniff_delimiter(b"ID\tWB01\n"), b'\t');
        assert_eq!(sniff_delimiter(b"ID\n"), b',');
    }

    #[test]
    fn short_rows_are_padded() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(&dir, "in.csv", "\u{feff}ID;WB01;WB02\nP1;1\nP2;1;\"2\"\n");
        let t = read_csv_table(&p, None).unwrap();
        assert_eq!(t.source, "in.csv");
        assert_eq!(t.headers[0].raw, "ID");
        assert_eq!(
            t.rows,
            vec![
                vec!["P1".to_string(), "1".to_string(), "".to_string()],
                vec!["P2".to_string(), "1".to_string(), "2".to_string()],
            ]
        );
    }

    #[test]
    fn long_rows_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(&dir, "in.csv", "ID,WB01\nP1,1\nP2,1,2\n");
        match read_csv_table(&p, None) {
            Err(ConvertError::CsvLineTooLong { lineno, found, .. }) => {
                assert_eq!((lineno, found), (3, 3))
            }
            x => panic!("unexpected result {:?}", x),
        }
        let p = write(&dir, "empty.csv", "");
        assert!(matches!(
            read_csv_table(&p, None),
            Err(ConvertError::EmptyInput { .. })
        ));
    }

    #[test]
    fn id_maps() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(&dir, "ids.tsv", "external\tlocal\n X-1 \t001\n\t002\nX-2\t002\n");
        let m = read_id_map(&p).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.get("X-1").map(|s| s.as_str()), Some("001"));

        let p = write(&dir, "bad.csv", "external,local\nX-1\n");
        assert!(matches!(
            read_id_map(&p),
            Err(ConvertError::CsvLineTooShort { lineno: 2, .. })
        ));
    }
}
