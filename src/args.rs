use clap::Parser;

/// This program converts survey exports into per-subject, per-session datasets.
#[derive(Parser, Debug, Clone, Default)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// (file path, optional) The JSON file describing the conversion run. Paths in this file are relative to
    /// its directory. All the other options override the values of this file.
    #[clap(short, long, value_parser)]
    pub config: Option<String>,

    /// (file path) A reference report in JSON format. If provided, surveyconv will check that the produced
    /// report matches the reference.
    #[clap(short, long, value_parser)]
    pub reference: Option<String>,

    /// (file path, 'stdout' or empty) If specified, the conversion report will be written in JSON format to the
    /// given location.
    #[clap(short, long, value_parser)]
    pub out: Option<String>,

    /// (file path) The survey export to convert.
    #[clap(short, long, value_parser)]
    pub input: Option<String>,

    /// (csv, excel or lsa) The type of the input. Guessed from the extension if not specified.
    #[clap(long, value_parser)]
    pub input_type: Option<String>,

    /// When using an Excel file with several worksheets, the name of the worksheet to use.
    #[clap(long, value_parser)]
    pub excel_worksheet_name: Option<String>,

    /// (directory, can be repeated) The roots of the template library, project library first.
    #[clap(short, long, value_parser)]
    pub library: Vec<String>,

    /// The name of the column holding the participant identifiers.
    #[clap(long, value_parser)]
    pub subject_column: Option<String>,

    /// The name of the column holding the session of each row, if any.
    #[clap(long, value_parser)]
    pub session_column: Option<String>,

    /// (error, keep_first, keep_last or split_to_sessions) What to do with repeated participant identifiers.
    #[clap(long, value_parser)]
    pub duplicate_policy: Option<String>,

    /// (list of comma-separated template keys) Only use these templates.
    #[clap(long, value_parser, value_delimiter = ',')]
    pub instruments: Option<Vec<String>>,

    /// (directory) Where to write the dataset.
    #[clap(long, value_parser)]
    pub output_directory: Option<String>,

    /// If passed as an argument, existing files of the dataset may be replaced.
    #[clap(long, takes_value = false)]
    pub overwrite: bool,

    /// If passed as an argument, only the report is produced and nothing is written to the dataset.
    #[clap(long, takes_value = false)]
    pub dry_run: bool,

    // Other arguments
    /// If passed as an argument, will turn on verbose logging to the standard output.
    #[clap(long, takes_value = false)]
    pub verbose: bool,
}
