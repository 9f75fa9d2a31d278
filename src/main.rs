use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};

use xtilens::config::AnalysisConfig;
use xtilens::flow::{self, FlowFilter};
use xtilens::ingest::IngestError;
use xtilens::model::{self, TraceModel};
use xtilens::output::{Formatter, write_output};
use xtilens::scenario::{self, Scenario, StepStatus};
use xtilens::validate::{Severity, ValidationIssue};
use xtilens::Analysis;

const EXIT_OK: u8 = 0;
const EXIT_INVALID_INPUT: u8 = 2;
const EXIT_INVALID_XML: u8 = 3;
const EXIT_SCENARIO_FAILED: u8 = 4;

#[derive(Parser)]
#[command(
    name = "xtilens",
    version,
    about = "Analytical pipeline for Universal Tracer SIM/eUICC BIP traces"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SeverityArg {
    Info,
    Warning,
    Critical,
}

impl From<SeverityArg> for Severity {
    fn from(value: SeverityArg) -> Severity {
        match value {
            SeverityArg::Info => Severity::Info,
            SeverityArg::Warning => Severity::Warning,
            SeverityArg::Critical => Severity::Critical,
        }
    }
}

#[derive(Args)]
struct CommonArgs {
    /// Path to the .xti trace file
    xti_file: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Write output to a file instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct ParsingLogArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Show all severities
    #[arg(long)]
    all: bool,

    /// Include a severity (repeatable; default: warning)
    #[arg(long, value_enum)]
    severity: Vec<SeverityArg>,

    /// Only issues whose category contains this string (repeatable)
    #[arg(long)]
    category: Vec<String>,

    /// Only issues at or after this timestamp
    #[arg(long)]
    since: Option<String>,

    /// Only issues at or before this timestamp
    #[arg(long)]
    until: Option<String>,
}

#[derive(Args)]
struct ScenarioArgs {
    /// Scenario name (use -l to list)
    scenario_name: Option<String>,

    /// Path to the .xti trace file
    xti_file: Option<PathBuf>,

    /// List all scenario names
    #[arg(short = 'l', long)]
    list: bool,

    /// Scenario config file (JSON); built-in Default scenario otherwise
    #[arg(long)]
    scenarios: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Write output to a file instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the flow overview (sessions + key events) in chronological order
    FlowOverview(CommonArgs),
    /// Print sessions only
    FlowSessions(CommonArgs),
    /// Print key events only
    FlowEvents(CommonArgs),
    /// Print the parsing log (validation issues)
    ParsingLog(ParsingLogArgs),
    /// Print the detected ICCID
    Iccid(CommonArgs),
    /// Print validation statistics
    Stats(CommonArgs),
    /// Run a saved scenario against a trace (or list scenarios with -l)
    Scenario(ScenarioArgs),
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            eprintln!("Error: {error:#}");
            ExitCode::from(exit_code_for(&error))
        }
    }
}

fn exit_code_for(error: &anyhow::Error) -> u8 {
    for cause in error.chain() {
        if let Some(ingest) = cause.downcast_ref::<IngestError>() {
            return match ingest {
                IngestError::InvalidXml(_) | IngestError::MissingRoot => EXIT_INVALID_XML,
                _ => EXIT_INVALID_INPUT,
            };
        }
    }
    EXIT_INVALID_INPUT
}

fn load_model(path: &Path) -> Result<TraceModel> {
    xtilens::load(path).with_context(|| format!("failed to load {}", path.display()))
}

fn run(command: Command) -> Result<u8> {
    match command {
        Command::FlowOverview(args) => run_flow(args, FlowFilter::All),
        Command::FlowSessions(args) => run_flow(args, FlowFilter::Sessions),
        Command::FlowEvents(args) => run_flow(args, FlowFilter::Events),
        Command::ParsingLog(args) => run_parsing_log(args),
        Command::Iccid(args) => {
            let model = load_model(&args.xti_file)?;
            let text = Formatter::new(args.format == Format::Json)
                .iccid(&args.xti_file.display().to_string(), model.iccid.as_deref());
            write_output(&text, args.out.as_deref())?;
            Ok(EXIT_OK)
        }
        Command::Stats(args) => {
            let model = load_model(&args.xti_file)?;
            let issues = xtilens::validate(&model, &AnalysisConfig::default());
            let text = Formatter::new(args.format == Format::Json)
                .stats(&args.xti_file.display().to_string(), &issues);
            write_output(&text, args.out.as_deref())?;
            Ok(EXIT_OK)
        }
        Command::Scenario(args) => run_scenario_cmd(args),
    }
}

fn run_flow(args: CommonArgs, filter: FlowFilter) -> Result<u8> {
    let model = load_model(&args.xti_file)?;
    let config = AnalysisConfig::default();
    let analysis = Analysis::run(&model, &config);
    let rows = flow::filter(analysis.timeline, filter);
    let text = Formatter::new(args.format == Format::Json).flow(
        &args.xti_file.display().to_string(),
        &model,
        &analysis.sessions,
        &rows,
        &config,
    );
    write_output(&text, args.out.as_deref())?;
    Ok(EXIT_OK)
}

fn run_parsing_log(args: ParsingLogArgs) -> Result<u8> {
    let model = load_model(&args.common.xti_file)?;
    let issues = xtilens::validate(&model, &AnalysisConfig::default());

    let severities: Option<Vec<Severity>> = if args.all {
        None
    } else if args.severity.is_empty() {
        Some(vec![Severity::Warning])
    } else {
        Some(args.severity.iter().map(|&s| s.into()).collect())
    };
    let label = match &severities {
        None => "ALL".to_string(),
        Some(list) => list
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(","),
    };

    let since = parse_bound(args.since.as_deref(), "--since")?;
    let until = parse_bound(args.until.as_deref(), "--until")?;

    let filtered: Vec<ValidationIssue> = issues
        .into_iter()
        .filter(|issue| {
            severities
                .as_ref()
                .is_none_or(|list| list.contains(&issue.severity))
        })
        .filter(|issue| match since {
            Some(bound) => issue.timestamp.is_some_and(|ts| ts >= bound),
            None => true,
        })
        .filter(|issue| match until {
            Some(bound) => issue.timestamp.is_none_or(|ts| ts <= bound),
            None => true,
        })
        .filter(|issue| {
            args.category.is_empty()
                || args.category.iter().any(|needle| {
                    issue
                        .category
                        .to_lowercase()
                        .contains(&needle.to_lowercase())
                })
        })
        .collect();

    let text = Formatter::new(args.common.format == Format::Json).parsing_log(
        &args.common.xti_file.display().to_string(),
        &filtered,
        &label,
    );
    write_output(&text, args.common.out.as_deref())?;
    Ok(EXIT_OK)
}

fn parse_bound(value: Option<&str>, flag: &str) -> Result<Option<chrono::NaiveDateTime>> {
    match value {
        None => Ok(None),
        Some(text) => match model::parse_timestamp(text) {
            Some(ts) => Ok(Some(ts)),
            None => bail!("{flag}: unrecognised timestamp: {text}"),
        },
    }
}

fn load_scenarios(path: Option<&Path>) -> Result<(BTreeMap<String, Scenario>, String)> {
    match path {
        Some(path) => scenario::load_scenarios(path)
            .with_context(|| format!("failed to load scenarios from {}", path.display())),
        None => {
            let default = Scenario::default_scenario();
            let selected = default.name.clone();
            let mut scenarios = BTreeMap::new();
            scenarios.insert(default.name.clone(), default);
            Ok((scenarios, selected))
        }
    }
}

fn run_scenario_cmd(args: ScenarioArgs) -> Result<u8> {
    let (scenarios, selected) = load_scenarios(args.scenarios.as_deref())?;
    let formatter = Formatter::new(args.format == Format::Json);

    if args.list {
        let names: Vec<String> = scenarios.keys().cloned().collect();
        let text = formatter.scenario_list(&names, &selected);
        write_output(&text, args.out.as_deref())?;
        return Ok(EXIT_OK);
    }

    let (Some(name), Some(xti_file)) = (&args.scenario_name, &args.xti_file) else {
        bail!("usage: scenario -l  OR  scenario <name> <file.xti>");
    };
    let scenario = scenario::find_scenario(&scenarios, name)?;

    let model = load_model(xti_file)?;
    let result = xtilens::run_scenario(&model, scenario, &AnalysisConfig::default());
    let text = formatter.scenario(&xti_file.display().to_string(), &scenario.name, &result);
    write_output(&text, args.out.as_deref())?;

    if result.overall == StepStatus::Fail {
        Ok(EXIT_SCENARIO_FAILED)
    } else {
        Ok(EXIT_OK)
    }
}
