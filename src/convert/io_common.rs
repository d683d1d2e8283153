use std::path::Path;
use std::str::FromStr;

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum InputType {
    Csv,
    Excel,
    Lsa,
}

impl FromStr for InputType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" | "tsv" | "txt" => Ok(InputType::Csv),
            "excel" | "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => Ok(InputType::Excel),
            "lsa" | "limesurvey" => Ok(InputType::Lsa),
            x => Err(format!(
                "unknown input type {:?} (expected csv, excel or lsa)",
                x
            )),
        }
    }
}

impl InputType {
    /// The type of a file from its extension.
    pub fn guess(path: &Path) -> Option<InputType> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(|e| e.parse::<InputType>().ok())
    }
}

pub fn simplify_file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| path.to_string())
}

/// The digest recorded in the report to match runs on the same input.
pub fn input_digest(bytes: &[u8]) -> String {
    sha256::digest(bytes)
}

// Spreadsheet editors like to prefix UTF-8 exports with a byte order mark.
pub fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes)
}
