/*!

This is the long-form manual for `instrument_core` and `surveyconv`.

## Input formats

The following formats are supported:
* `csv` delimited text (comma, semicolon or tab)
* `excel` spreadsheets (`.xlsx`, `.xls`, `.ods`)
* `lsa` response archives of the LimeSurvey platform

### `csv`

The first row holds the column names, every further row one participant (or
one visit of a participant). The delimiter is guessed from the header line
when it is not given with `delimiter`. Rows may be shorter than the header,
the missing cells are empty. A row longer than the header is rejected.

### `excel`

The first row of the worksheet holds the column names. When the workbook has
more than one sheet, the name of the sheet to read must be given with
`excelWorksheetName`.

### `lsa`

A LimeSurvey archive contains the structure of the survey (`.lss`) and the
responses (`.lsr`). Responses are exported under internal codes such as
`123456X12X345SQ001` that have nothing to do with the item ids of an
instrument. The structure is used to propose a name for each code: the
question title, or for array questions the subquestion title. The proposal
is checked against the template library like any other column name.

The same decoding can be applied to a CSV or Excel export with the structure
file given separately as `archiveStructure`.

## Templates

A template describes one instrument. It is a JSON document with a `Study`
block and one entry per item, either at the top level or under `Questions`:

```json
{
  "Study": {
    "OriginalName": "WHO-5 Well-Being Index",
    "ShortName": "wellbeing",
    "Languages": ["en", "de"]
  },
  "WB01": {
    "Description": {"en": "I have felt cheerful", "de": "Ich war froh"},
    "Levels": {"0": "at no time", "5": "all of the time"},
    "Aliases": ["who5_1"]
  },
  "WB02": {
    "Description": {"en": "I have felt calm and relaxed"},
    "MinValue": 0,
    "MaxValue": 5,
    "Reversed": true
  },
  "WB2": {
    "Description": {"en": "old name of WB02"},
    "AliasOf": "WB02"
  }
}
```

Item keys:
* `Description` (required) text per language
* `Levels` raw value to label. Labels may be strings or per-language objects.
* `MinValue`, `MaxValue` numeric bounds. Bounds that exclude some of the
declared levels are a template error, reported when a column uses the item.
* `Reversed` kept in the sidecars for scoring, the values are not changed
* `AliasOf` the item is another name for the given item of the same template.
Chains of aliases are followed; a cycle stops the run.
* `Aliases` further acceptable column names
* `SessionHint`, `RunHint` where the item lands when the column name does not say
* `DescriptionAlias` when `true`, the description texts are acceptable column names

The template key (and task name) is `Study.ShortName`, else `Study.TaskName`,
else the file name without its `survey-` prefix.

Several library roots may be given. They are searched in order and a template
found in an earlier root hides the templates of the same key in later roots.

## Matching columns

Each column name is matched in the following order. The first rule that finds
something wins:
1. the name is an item id
2. the name is an alias
3. the name is an item id or an alias once case and spaces are ignored
4. the name ends with a session or run indicator (`_ses-2`, `_run-1`, ...):
the indicator is removed and rules 1 to 3 are tried again

A name that leads to more than one item (for example through two templates
that use the same alias) stops the run: the program never picks one. Two
columns that end on the same item, session and run also stop the run. A name
without a run indicator is the first run: `WB01` and `WB01_run-1` collide.

The subject and session columns are set aside. All the other columns that
match nothing are listed as unmatched; they can feed `participants.tsv`
through the participants mapping.

## Duplicate identifiers

Identifiers are normalized to `sub-<label>` by keeping letters and digits,
in any script, lower-cased.
`P-01` and `p01` are therefore the same subject. The `duplicatePolicy` option
decides what happens to repeated subjects:
* `error` (default) stops the run and lists every repeated identifier
* `keep_first` keeps the first row
* `keep_last` keeps the last row
* `split_to_sessions` puts each repetition in the next session (`ses-2`, `ses-3`, ...)

## Values

A cell is `missing` when it is one of the missing tokens (by default the empty
string, `n/a`, `na`, `nan` and `.`). Otherwise, the value must be one of the
levels of the item (`1.0` matches the level `1`, a label matches its level), or
a number within the bounds. Offending values are reported once per column with
a few examples. They are still written to the output.

## Preview and commit

With `--dry-run`, the program stops after the validation and prints the
report. Without it, the same report is produced and the files are written.
Both reports are identical, except for the list of written files.

The program refuses to write over existing files unless `overwrite` is set.

## Configuration

The program accepts a configuration file in JSON. Paths are relative to the
directory of the configuration file. The command line flags take precedence.

```json
{
  "inputFile": "wellbeing.csv",
  "libraryPaths": ["library", "/shared/templates"],
  "subjectColumn": "ID",
  "duplicatePolicy": "keep_last",
  "outputDirectory": "dataset"
}
```

Options:
 - `inputFile` (string): the data to convert
 - `inputType` (string, optional): `csv`, `excel` or `lsa`. Guessed from the extension if not provided.
 - `excelWorksheetName` (string, optional)
 - `delimiter` (string, optional): for `csv` inputs
 - `archiveStructure` (string, optional): a `.lss` file to decode the column names of a CSV or Excel export
 - `libraryPaths` (array of strings): the template library roots, project library first
 - `subjectColumn` (string): the column holding the participant identifiers
 - `sessionColumn` (string, optional): a column holding the session of each row
 - `duplicatePolicy` (string, optional): see above
 - `instruments` (array of strings, optional): only use these templates
 - `idMapFile` (string, optional): a two-column file mapping external identifiers to local identifiers
 - `participantsMapping` (string, optional): a JSON object mapping unmatched column names to `participants.tsv` columns
 - `outputDirectory` (string): where to write the dataset
 - `overwrite` (boolean, optional)
 - `datasetSidecar` (boolean, optional): also write `task-<task>_survey.json` at the root of the dataset
 - `missingTokens` (array of strings, optional)
 - `missingnessThreshold` (number, optional, default 0.5)
 - `valueSampleLimit` (number, optional, default 5)

*/
