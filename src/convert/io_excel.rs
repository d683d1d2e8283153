use calamine::{open_workbook_auto, DataType, Range, Reader};
use std::fs;

use crate::convert::io_common::{input_digest, simplify_file_name};
use crate::convert::*;

/// Renders a cell the way it would appear in a text export.
pub fn render_cell(cell: &DataType) -> String {
    match cell {
        DataType::Empty => "".to_string(),
        DataType::String(s) => s.clone(),
        DataType::Int(i) => i.to_string(),
        // Integral floats print without a decimal point.
        DataType::Float(f) => f.to_string(),
        DataType::Bool(b) => b.to_string(),
        x => x.to_string(),
    }
}

fn get_range(path: &str, worksheet_name_o: Option<&str>) -> ConvertResult<Range<DataType>> {
    debug!(
        "read_excel_table: path: {:?} worksheet: {:?}",
        path, worksheet_name_o
    );
    let mut workbook = open_workbook_auto(path).context(OpeningExcelSnafu { path })?;

    // A worksheet name was provided, use it.
    if let Some(worksheet_name) = worksheet_name_o {
        let wrange = workbook
            .worksheet_range(worksheet_name)
            .context(MissingWorksheetSnafu {
                name: worksheet_name,
                path,
            })?
            .context(OpeningExcelSnafu { path })?;
        Ok(wrange)
    } else {
        let all_worksheets = workbook.worksheets();
        match all_worksheets.as_slice() {
            [(worksheet_name, wrange)] => {
                debug!(
                    "read_excel_table: path: {:?} worksheet: {:?}",
                    path, worksheet_name
                );
                Ok(wrange.clone())
            }
            names => {
                warn!(
                    "read_excel_table: {}: {} worksheets, the worksheet name must be provided",
                    path,
                    names.len()
                );
                EmptyExcelSnafu { path }.fail()
            }
        }
    }
}

/// Reads the first row of a worksheet as header and the other rows as data.
///
/// Columns after the last named one and rows without any content are ignored.
pub fn read_excel_table(path: &str, worksheet: Option<&str>) -> ConvertResult<InputTable> {
    let bytes = fs::read(path).context(OpeningFileSnafu { path })?;
    let wrange = get_range(path, worksheet)?;

    let mut rows = wrange.rows();
    let header_row = rows.next().context(EmptyExcelSnafu { path })?;
    let mut headers: Vec<String> = header_row.iter().map(render_cell).collect();
    while headers.last().map(|h| h.trim().is_empty()).unwrap_or(false) {
        headers.pop();
    }
    ensure!(!headers.is_empty(), EmptyInputSnafu { path });
    let width = headers.len();

    let mut data: Vec<Vec<String>> = Vec::new();
    for (idx, row) in rows.enumerate() {
        let cells: Vec<String> = row.iter().take(width).map(render_cell).collect();
        if cells.iter().all(|c| c.trim().is_empty()) {
            debug!("read_excel_table: skipping empty row {}", idx + 2);
            continue;
        }
        data.push(cells);
    }
    info!(
        "read_excel_table: {}: {} columns, {} rows",
        path,
        width,
        data.len()
    );
    Ok(InputTable::new(
        &simplify_file_name(path),
        &input_digest(&bytes),
        &headers,
        data,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells() {
        assert_eq!(render_cell(&DataType::Float(3.0)), "3");
        assert_eq!(render_cell(&DataType::Float(2.5)), "2.5");
        assert_eq!(render_cell(&DataType::Int(-4)), "-4");
        assert_eq!(render_cell(&DataType::Empty), "");
        assert_eq!(render_cell(&DataType::String("n/a".to_string())), "n/a");
    }

    #[test]
    fn missing_workbook() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("none.xlsx").display().to_string();
        assert!(matches!(
            read_excel_table(&p, None),
            Err(ConvertError::OpeningFile { .. })
        ));
    }
}
