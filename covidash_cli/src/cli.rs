use std::fs::File;
use std::path::Path;

use anyhow::Context;
use clap::{command, Args, Parser, Subcommand};
use covidash::aggregate::DerivedMetric;
use covidash::catalog::Database;
use covidash::config::Config;
use covidash::error::CovidashError;
use covidash::formatters::{CSVFormatter, JSONFormatter, OutputFormatter, OutputGenerator};
use covidash::query::{DateRange, Entity, Metric};
use covidash::Dashboard;
use enum_dispatch::enum_dispatch;
use log::{debug, info, warn};
use nonempty::NonEmpty;
use polars::frame::DataFrame;
use serde::{Deserialize, Serialize};
use spinners::{Spinner, Spinners};
use strum_macros::EnumString;

use crate::display::{display_comments, display_table, display_tables};
use crate::error::{CovidashCliError, CovidashCliResult};
use crate::server;

const DEFAULT_PROGRESS_SPINNER: Spinners = Spinners::Dots;
const COMPLETE_PROGRESS_STRING: &str = "✔";
const RUNNING_TAIL_STRING: &str = "...";
const QUERYING_STRING: &str = "Querying warehouse";

/// Defines the output formats we are able to produce tables in.
#[derive(Clone, Debug, Deserialize, Serialize, EnumString, PartialEq, Eq)]
#[strum(ascii_case_insensitive)]
pub enum OutputFormat {
    Csv,
    Json,
    Stdout,
}

impl From<&OutputFormat> for OutputFormatter {
    fn from(value: &OutputFormat) -> Self {
        match value {
            OutputFormat::Csv => OutputFormatter::Csv(CSVFormatter),
            OutputFormat::Json => OutputFormatter::Json(JSONFormatter { pretty: false }),
            OutputFormat::Stdout => OutputFormatter::Json(JSONFormatter { pretty: true }),
        }
    }
}

impl From<OutputFormat> for OutputFormatter {
    fn from(value: OutputFormat) -> Self {
        Self::from(&value)
    }
}

fn write_output<T, U>(
    output_generator: T,
    mut data: DataFrame,
    output_file: Option<U>,
) -> CovidashCliResult<()>
where
    T: OutputGenerator,
    U: AsRef<Path>,
{
    if let Some(output_file) = output_file {
        let mut f = File::create(output_file).context("Failed to write output")?;
        output_generator.save(&mut f, &mut data)?;
    } else {
        let mut stdout_lock = std::io::stdout().lock();
        output_generator.save(&mut stdout_lock, &mut data)?;
    };
    Ok(())
}

fn start_spinner(quiet: bool, message: &str) -> Option<Spinner> {
    (!quiet).then(|| {
        Spinner::with_timer(
            DEFAULT_PROGRESS_SPINNER,
            message.to_string() + RUNNING_TAIL_STRING,
        )
    })
}

fn stop_spinner(sp: Option<Spinner>) {
    if let Some(mut s) = sp {
        s.stop_with_symbol(COMPLETE_PROGRESS_STRING);
    }
}

/// Trait that defines what to run when a given subcommand is invoked.
#[enum_dispatch]
pub trait RunCommand {
    async fn run(&self, config: Config) -> CovidashCliResult<()>;
}

/// The `serve` command exposes the dashboard over HTTP.
#[derive(Args, Debug)]
pub struct ServeCommand {
    #[arg(short, long, help = "Address to listen on, overriding the config file")]
    bind: Option<String>,
}

impl RunCommand for ServeCommand {
    async fn run(&self, config: Config) -> CovidashCliResult<()> {
        info!("Running `serve` subcommand");
        let bind = self.bind.clone().unwrap_or_else(|| config.server.bind.clone());
        let dashboard = Dashboard::new_with_config(config).await?;
        server::serve(dashboard, &bind).await
    }
}

/// The `lookup` command prints one metric for a country on a date.
#[derive(Args, Debug)]
pub struct LookupCommand {
    #[arg(value_name = "METRIC", help = "Metric key, e.g. total_cases")]
    metric: String,
    #[arg(short, long, help = "Country name, matched exactly")]
    country: String,
    #[arg(short, long, help = "Date as YYYY-MM-DD")]
    date: String,
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for LookupCommand {
    async fn run(&self, config: Config) -> CovidashCliResult<()> {
        info!("Running `lookup` subcommand");
        let sp = start_spinner(self.quiet, QUERYING_STRING);
        let dashboard = Dashboard::new_with_config(config).await?;
        let point = dashboard
            .lookup(&self.metric, &self.country, &self.date)
            .await;
        dashboard.close();
        stop_spinner(sp);
        println!("{}", serde_json::to_string_pretty(&point?)?);
        Ok(())
    }
}

/// The `describe` command lists the tables of a database, or the columns of one table.
#[derive(Args, Debug)]
pub struct DescribeCommand {
    #[arg(value_name = "DATABASE", help = "COVID_DATA or GLOBAL")]
    database: String,
    #[arg(value_name = "TABLE", help = "Table to describe. Lists tables when omitted")]
    table: Option<String>,
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for DescribeCommand {
    async fn run(&self, config: Config) -> CovidashCliResult<()> {
        info!("Running `describe` subcommand");
        let Some(table) = self.table.as_deref() else {
            display_tables(&self.database, &Database::parse(&self.database)?.tables());
            return Ok(());
        };
        let sp = start_spinner(self.quiet, QUERYING_STRING);
        let dashboard = Dashboard::new_with_config(config).await?;
        let description = dashboard.describe(&self.database, table).await;
        dashboard.close();
        stop_spinner(sp);
        display_table(&description?)?;
        Ok(())
    }
}

/// The `report` command renders every chart of the dashboard into one HTML page.
#[derive(Args, Debug)]
pub struct ReportCommand {
    #[arg(short = 'o', long, help = "Output file for the HTML page. Printed when omitted")]
    output_file: Option<String>,
    #[arg(long, help = "Override the focus country of the report")]
    focus_country: Option<String>,
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for ReportCommand {
    async fn run(&self, mut config: Config) -> CovidashCliResult<()> {
        info!("Running `report` subcommand");
        if let Some(country) = &self.focus_country {
            config.report.focus_country.clone_from(country);
        }
        let sp = start_spinner(self.quiet, "Building report");
        let dashboard = Dashboard::new_with_config(config).await?;
        let report = dashboard.visual_report().await;
        dashboard.close();
        stop_spinner(sp);
        for slot in report.unavailable() {
            warn!("{slot} chart is unavailable");
        }
        let page = report.to_html_page();
        match &self.output_file {
            Some(path) => std::fs::write(path, page).context("Failed to write report")?,
            None => println!("{page}"),
        }
        Ok(())
    }
}

fn parse_metric(value: &str) -> Result<Metric, CovidashError> {
    Metric::from_key(value)
}

/// The `series` command outputs metrics by date and country, optionally with rates.
#[derive(Args, Debug)]
pub struct SeriesCommand {
    #[arg(
        short,
        long = "metric",
        value_name = "METRIC",
        value_parser = parse_metric,
        required = true,
        num_args = 1..,
        help = "Metric keys to include, e.g. total_cases total_death"
    )]
    metrics: Vec<Metric>,
    #[arg(
        long,
        value_name = "START...END",
        help = "\
            Inclusive date range, e.g. 2021-01-01...2021-12-31, or a single date.\n\
            All dates when omitted."
    )]
    range: Option<DateRange>,
    #[arg(long, help = "Restrict to one country")]
    country: Option<String>,
    #[arg(long, help = "Append mortality, vaccination and unvaccination rates")]
    rates: bool,
    #[arg(
        short = 'f',
        long,
        value_name = "csv|json|stdout",
        default_value = "stdout",
        help = "Output format for the results"
    )]
    output_format: OutputFormat,
    #[arg(short = 'o', long, help = "Output file to place the results")]
    output_file: Option<String>,
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for SeriesCommand {
    async fn run(&self, config: Config) -> CovidashCliResult<()> {
        info!("Running `series` subcommand");
        let metrics = NonEmpty::from_vec(self.metrics.clone())
            .context("At least one metric is required")?;
        let entity = self.country.as_deref().map(Entity::new).transpose()?;
        let derived: &[DerivedMetric] = if self.rates {
            &DerivedMetric::ALL
        } else {
            &[]
        };
        let sp = start_spinner(self.quiet, QUERYING_STRING);
        let dashboard = Dashboard::new_with_config(config).await?;
        let table = dashboard
            .series(&metrics, self.range.as_ref(), entity.as_ref(), derived)
            .await;
        dashboard.close();
        stop_spinner(sp);
        let table = table?;
        debug!("series shape: {:?}", table.frame().shape());

        if self.output_format == OutputFormat::Stdout && self.output_file.is_none() {
            display_table(&table)?;
            return Ok(());
        }
        let formatter: OutputFormatter = (&self.output_format).into();
        write_output(formatter, table.into_frame(), self.output_file.as_deref())
    }
}

/// Commands for annotating data points.
#[derive(Subcommand, Debug)]
#[enum_dispatch(RunCommand)]
pub enum CommentCommands {
    /// Attach a comment to a data point
    Add(CommentAddCommand),
    /// List the comments on a data point, oldest first
    List(CommentListCommand),
}

#[derive(Args, Debug)]
pub struct CommentAddCommand {
    #[arg(value_name = "DATAPOINT_ID")]
    datapoint_id: String,
    #[arg(short, long)]
    user: String,
    #[arg(short, long)]
    comment: String,
}

impl RunCommand for CommentAddCommand {
    async fn run(&self, config: Config) -> CovidashCliResult<()> {
        info!("Running `comment add` subcommand");
        let dashboard = comment_dashboard(config).await?;
        let comment = dashboard
            .add_comment(&self.datapoint_id, &self.user, &self.comment)
            .await?;
        println!("{}", serde_json::to_string_pretty(&comment)?);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct CommentListCommand {
    #[arg(value_name = "DATAPOINT_ID")]
    datapoint_id: String,
}

impl RunCommand for CommentListCommand {
    async fn run(&self, config: Config) -> CovidashCliResult<()> {
        info!("Running `comment list` subcommand");
        let dashboard = comment_dashboard(config).await?;
        display_comments(&dashboard.comments(&self.datapoint_id).await?);
        Ok(())
    }
}

/// Comments outlive a single invocation only with a configured store.
async fn comment_dashboard(config: Config) -> CovidashCliResult<Dashboard> {
    if config.comments.path.is_none() {
        return Err(CovidashCliError::Anyhow(anyhow::anyhow!(
            "No comment store configured, set `comments.path` in the config file"
        )));
    }
    Ok(Dashboard::new_with_config(config).await?)
}

/// Query COVID-19 case, testing and vaccination data, and serve the dashboard.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None, name = "covidash")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    #[arg(
        short = 'q',
        long = "quiet",
        help = "\
            Do not print progress spinner to stdout. Results and logs (when `RUST_LOG`\n\
            is set) will still be printed.",
        global = true
    )]
    quiet: bool,
}

/// Commands contains the list of subcommands available for use in the CLI.
/// Each command should implement the RunCommand trait and specify the list
/// of required args for that command.
#[derive(Subcommand, Debug)]
#[enum_dispatch(RunCommand)]
pub enum Commands {
    /// Serve the dashboard and its JSON API over HTTP
    Serve(ServeCommand),
    /// Look up one metric for a country on a date
    Lookup(LookupCommand),
    /// Describe the tables of a database
    Describe(DescribeCommand),
    /// Render the dashboard report as an HTML page
    Report(ReportCommand),
    /// Output metrics by date and country
    Series(SeriesCommand),
    /// Add and list comments on data points
    #[command(subcommand)]
    Comment(CommentCommands),
}
