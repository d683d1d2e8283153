use crate::convert::io_common::InputType;
use crate::convert::io_csv::read_id_map;
use crate::convert::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The JSON configuration of a run. See the manual for the meaning of the keys.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunConfig {
    #[serde(rename = "inputFile")]
    pub input_file: Option<String>,
    #[serde(rename = "inputType")]
    pub input_type: Option<String>,
    #[serde(rename = "excelWorksheetName")]
    pub excel_worksheet_name: Option<String>,
    pub delimiter: Option<String>,
    #[serde(rename = "archiveStructure")]
    pub archive_structure: Option<String>,
    #[serde(rename = "libraryPaths", default)]
    pub library_paths: Vec<String>,
    #[serde(rename = "subjectColumn")]
    pub subject_column: Option<String>,
    #[serde(rename = "sessionColumn")]
    pub session_column: Option<String>,
    #[serde(rename = "duplicatePolicy")]
    pub duplicate_policy: Option<String>,
    pub instruments: Option<Vec<String>>,
    #[serde(rename = "idMapFile")]
    pub id_map_file: Option<String>,
    #[serde(rename = "participantsMapping")]
    pub participants_mapping: Option<String>,
    #[serde(rename = "outputDirectory")]
    pub output_directory: Option<String>,
    pub overwrite: Option<bool>,
    #[serde(rename = "datasetSidecar")]
    pub dataset_sidecar: Option<bool>,
    #[serde(rename = "missingTokens")]
    pub missing_tokens: Option<Vec<String>>,
    #[serde(rename = "missingnessThreshold")]
    pub missingness_threshold: Option<f64>,
    #[serde(rename = "valueSampleLimit")]
    pub value_sample_limit: Option<usize>,
}

/// Everything a run needs, after merging the configuration file and the
/// command line.
#[derive(PartialEq, Debug, Clone)]
pub struct RunContext {
    pub input: PathBuf,
    pub input_type: InputType,
    pub worksheet: Option<String>,
    pub delimiter: Option<u8>,
    pub archive_structure: Option<PathBuf>,
    /// Project library first.
    pub library_paths: Vec<PathBuf>,
    pub participants_mapping: Option<PathBuf>,
    pub output_directory: Option<PathBuf>,
    pub overwrite: bool,
    pub dry_run: bool,
    pub params: RunParameters,
}

/// Resolves a path of the configuration file against its directory.
fn resolve_path(base: &Path, p: &str) -> PathBuf {
    let path = Path::new(p);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn parse_delimiter(s: &str) -> ConvertResult<u8> {
    match s {
        "\\t" | "tab" | "\t" => Ok(b'\t'),
        x if x.len() == 1 && x.is_ascii() => Ok(x.as_bytes()[0]),
        x => InvalidOptionSnafu {
            name: "delimiter",
            message: format!("{:?} is not a single character", x),
        }
        .fail(),
    }
}

pub fn read_config(path: &str) -> ConvertResult<RunConfig> {
    let config_str = fs::read_to_string(path).context(OpeningFileSnafu { path })?;
    let config: RunConfig = serde_json::from_str(&config_str).context(ParsingJsonSnafu { path })?;
    Ok(config)
}

impl RunContext {
    /// Merges the command line with the configuration file it names, if any.
    /// The command line wins.
    pub fn from_args(args: &Args) -> ConvertResult<RunContext> {
        let (config, base) = match args.config.as_ref() {
            Some(p) => {
                let config = read_config(p)?;
                let base = Path::new(p)
                    .parent()
                    .map(|d| d.to_path_buf())
                    .unwrap_or_default();
                info!("Read configuration {}", p);
                (config, base)
            }
            None => (RunConfig::default(), PathBuf::new()),
        };
        let from_config = |p: &Option<String>| p.as_ref().map(|s| resolve_path(&base, s));

        let input: PathBuf = args
            .input
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| from_config(&config.input_file))
            .context(MissingOptionSnafu { name: "inputFile" })?;

        let input_type = match args.input_type.as_ref().or(config.input_type.as_ref()) {
            Some(s) => s.parse::<InputType>().map_err(|message| ConvertError::InvalidOption {
                name: "inputType".to_string(),
                message,
            })?,
            None => InputType::guess(&input).context(UnknownInputTypeSnafu {
                path: input.display().to_string(),
            })?,
        };

        let library_paths: Vec<PathBuf> = if !args.library.is_empty() {
            args.library.iter().map(PathBuf::from).collect()
        } else {
            config
                .library_paths
                .iter()
                .map(|s| resolve_path(&base, s))
                .collect()
        };
        ensure!(
            !library_paths.is_empty(),
            MissingOptionSnafu {
                name: "libraryPaths"
            }
        );

        let subject_column = args
            .subject_column
            .as_ref()
            .or(config.subject_column.as_ref())
            .context(MissingOptionSnafu {
                name: "subjectColumn",
            })?;
        let mut params = RunParameters::new(subject_column);
        params.session_column = args
            .session_column
            .clone()
            .or_else(|| config.session_column.clone());
        if let Some(p) = args
            .duplicate_policy
            .as_ref()
            .or(config.duplicate_policy.as_ref())
        {
            params.duplicate_policy =
                p.parse::<DuplicatePolicy>()
                    .map_err(|message| ConvertError::InvalidOption {
                        name: "duplicatePolicy".to_string(),
                        message,
                    })?;
        }
        params.instruments = args
            .instruments
            .clone()
            .or_else(|| config.instruments.clone());
        if let Some(p) = from_config(&config.id_map_file) {
            params.id_map = read_id_map(&p.display().to_string())?;
        }
        if let Some(tokens) = config.missing_tokens.as_ref() {
            params.missing_tokens = tokens.clone();
        }
        if let Some(x) = config.missingness_threshold {
            ensure!(
                (0.0..=1.0).contains(&x),
                InvalidOptionSnafu {
                    name: "missingnessThreshold",
                    message: format!("{} is not between 0 and 1", x),
                }
            );
            params.missingness_threshold = x;
        }
        if let Some(x) = config.value_sample_limit {
            params.value_sample_limit = x;
        }
        params.dataset_sidecar = config.dataset_sidecar.unwrap_or(false);

        let delimiter = match config.delimiter.as_ref() {
            Some(s) => Some(parse_delimiter(s)?),
            None => None,
        };

        Ok(RunContext {
            input,
            input_type,
            worksheet: args
                .excel_worksheet_name
                .clone()
                .or_else(|| config.excel_worksheet_name.clone()),
            delimiter,
            archive_structure: from_config(&config.archive_structure),
            library_paths,
            participants_mapping: from_config(&config.participants_mapping),
            output_directory: args
                .output_directory
                .as_ref()
                .map(PathBuf::from)
                .or_else(|| from_config(&config.output_directory)),
            overwrite: args.overwrite || config.overwrite.unwrap_or(false),
            dry_run: args.dry_run,
            params,
        })
    }
}
