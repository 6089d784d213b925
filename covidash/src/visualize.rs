//! Turns a [`TabularResult`] and an [`Encoding`] into a self-contained HTML fragment: a `<div>`
//! and a script drawing into it with the Plotly library the page loads once.

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum_macros::{Display, EnumString};

use crate::cluster;
use crate::error::{CovidashError, Result};
use crate::table::TabularResult;
use crate::warehouse::Scalar;

/// Plotly's default qualitative palette.
const PALETTE: [&str; 10] = [
    "#636efa", "#ef553b", "#00cc96", "#ab63fa", "#ffa15a", "#19d3f3", "#ff6692", "#b6e880",
    "#ff97ff", "#fecb52",
];

/// Fill for choropleths without a color column.
const LOCATION_COLOR: &str = "#5e8fc2";

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Choropleth,
    Bar,
    Line,
}

/// How columns map onto a chart. For choropleths `x` is the column of country names.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoding {
    pub kind: ChartKind,
    pub x: String,
    pub y: Vec<String>,
    pub color: Option<String>,
    pub title: String,
    pub x_label: Option<String>,
    pub y_label: Option<String>,
    pub legend_title: Option<String>,
}

impl Encoding {
    fn new(kind: ChartKind, x: &str, y: &[&str], title: &str) -> Self {
        Self {
            kind,
            x: x.to_string(),
            y: y.iter().map(|s| s.to_string()).collect(),
            color: None,
            title: title.to_string(),
            x_label: None,
            y_label: None,
            legend_title: None,
        }
    }

    pub fn choropleth(location: &str, title: &str) -> Self {
        Self::new(ChartKind::Choropleth, location, &[], title)
    }

    pub fn bar(x: &str, y: &[&str], title: &str) -> Self {
        Self::new(ChartKind::Bar, x, y, title)
    }

    pub fn line(x: &str, y: &[&str], title: &str) -> Self {
        Self::new(ChartKind::Line, x, y, title)
    }

    /// Split traces by the values of `column`.
    pub fn with_color(mut self, column: &str) -> Self {
        self.color = Some(column.to_string());
        self
    }

    pub fn with_labels(mut self, x_label: &str, y_label: &str) -> Self {
        self.x_label = Some(x_label.to_string());
        self.y_label = Some(y_label.to_string());
        self
    }

    pub fn with_legend_title(mut self, title: &str) -> Self {
        self.legend_title = Some(title.to_string());
        self
    }
}

/// Color for a series or category, a stable function of its name.
pub fn stable_color(name: &str) -> &'static str {
    let hash = name
        .bytes()
        .fold(FNV_OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME));
    PALETTE[(hash % PALETTE.len() as u64) as usize]
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Element ids keep only ASCII alphanumerics, `-` and `_`.
fn element_id(id: &str) -> String {
    let id: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if id.is_empty() {
        "chart".to_string()
    } else {
        id
    }
}

/// JSON safe to embed in a `<script>` element.
fn script_json(value: &Value) -> String {
    value.to_string().replace("</", "<\\/")
}

/// An informational fragment shown instead of a chart.
pub fn placeholder(id: &str, message: &str) -> String {
    format!(
        "<div id=\"{}\" class=\"chart-placeholder\"><p>{}</p></div>",
        element_id(id),
        escape_html(message)
    )
}

fn require_column(table: &TabularResult, column: &str) -> Result<()> {
    if table.has_column(column) {
        Ok(())
    } else {
        Err(CovidashError::DataIntegrity(format!(
            "cannot chart missing column {column}"
        )))
    }
}

/// Distinct values of the color column in first-seen order, with the rows holding each.
fn groups(table: &TabularResult, column: &str) -> Result<Vec<(String, Vec<usize>)>> {
    let values = table.column_values(column)?;
    let mut groups: Vec<(String, Vec<usize>)> = vec![];
    for (row, value) in values.iter().enumerate() {
        if value.is_null() {
            continue;
        }
        let name = value.to_string();
        match groups.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, rows)) => rows.push(row),
            None => groups.push((name, vec![row])),
        }
    }
    Ok(groups)
}

fn pick(values: &[Value], rows: &[usize]) -> Vec<Value> {
    rows.iter().map(|&row| values[row].clone()).collect()
}

fn choropleth_traces(table: &TabularResult, encoding: &Encoding) -> Result<Vec<Value>> {
    let locations = table.column_values(&encoding.x)?;
    let trace = |name: &str, color: &str, rows: Vec<usize>, showlegend: bool| {
        let locations = rows
            .iter()
            .filter_map(|&row| match &locations[row] {
                Scalar::Null => None,
                location => Some(location.to_string()),
            })
            .collect_vec();
        json!({
            "type": "choropleth",
            "name": name,
            "locations": locations,
            "locationmode": "country names",
            "z": vec![1; locations.len()],
            "colorscale": [[0, color], [1, color]],
            "showscale": false,
            "showlegend": showlegend,
            "hovertemplate": "%{location}<extra>%{fullData.name}</extra>",
        })
    };
    Ok(match &encoding.color {
        None => vec![trace(&encoding.x, LOCATION_COLOR, (0..table.height()).collect(), false)],
        Some(color) => groups(table, color)?
            .into_iter()
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .map(|(category, rows)| {
                let name = format!("{color} {category}");
                trace(&name, stable_color(&name), rows, true)
            })
            .collect(),
    })
}

fn cartesian_traces(table: &TabularResult, encoding: &Encoding) -> Result<Vec<Value>> {
    let x = table.column_json(&encoding.x)?;
    let series = encoding
        .y
        .iter()
        .map(|y| Ok((y.as_str(), table.column_json(y)?)))
        .collect::<Result<Vec<_>>>()?;
    let trace = |name: &str, x: Vec<Value>, y: Vec<Value>| {
        let color = stable_color(name);
        match encoding.kind {
            ChartKind::Bar => json!({
                "type": "bar",
                "name": name,
                "x": x,
                "y": y,
                "marker": {"color": color},
            }),
            _ => json!({
                "type": "scatter",
                "mode": "lines",
                "name": name,
                "x": x,
                "y": y,
                "line": {"color": color},
            }),
        }
    };
    Ok(match &encoding.color {
        None => series
            .into_iter()
            .map(|(name, y)| trace(name, x.clone(), y))
            .collect(),
        Some(color) => {
            let groups = groups(table, color)?;
            let mut traces = vec![];
            for (name, y) in &series {
                for (category, rows) in &groups {
                    let label = if series.len() > 1 {
                        format!("{category} {name}")
                    } else {
                        category.clone()
                    };
                    traces.push(trace(&label, pick(&x, rows), pick(y, rows)));
                }
            }
            traces
        }
    })
}

fn layout(encoding: &Encoding) -> Value {
    let mut layout = json!({
        "title": {"text": encoding.title},
        "margin": {"t": 60, "l": 40, "r": 40, "b": 40},
    });
    match encoding.kind {
        ChartKind::Choropleth => {
            layout["geo"] = json!({"projection": {"type": "natural earth"}, "showframe": false});
        }
        ChartKind::Bar | ChartKind::Line => {
            layout["xaxis"] = json!({"title": {"text": encoding.x_label.as_deref().unwrap_or(&encoding.x)}});
            let y_label = match (&encoding.y_label, encoding.y.as_slice()) {
                (Some(label), _) => label.clone(),
                (None, [single]) => single.clone(),
                (None, _) => "value".to_string(),
            };
            layout["yaxis"] = json!({"title": {"text": y_label}});
            if encoding.kind == ChartKind::Bar {
                layout["barmode"] = json!("relative");
            }
        }
    }
    if let Some(title) = encoding.legend_title.as_ref().or(encoding.color.as_ref()) {
        layout["legend"] = json!({"title": {"text": title}});
    }
    layout
}

/// Render `table` as a chart drawn into a `<div>` with the given id.
pub fn render(table: &TabularResult, encoding: &Encoding, id: &str) -> Result<String> {
    require_column(table, &encoding.x)?;
    for column in encoding.y.iter().chain(&encoding.color) {
        require_column(table, column)?;
    }
    if encoding.kind != ChartKind::Choropleth && encoding.y.is_empty() {
        return Err(CovidashError::Validation(format!(
            "a {} chart needs at least one y column",
            encoding.kind
        )));
    }

    let traces = match encoding.kind {
        ChartKind::Choropleth => choropleth_traces(table, encoding)?,
        ChartKind::Bar | ChartKind::Line => cartesian_traces(table, encoding)?,
    };
    let id = element_id(id);
    debug!("rendering {} chart {id} with {} traces", encoding.kind, traces.len());
    Ok(format!(
        "<div id=\"{id}\" class=\"plotly-graph-div\" style=\"height:100%; width:100%;\"></div>\n\
         <script type=\"text/javascript\">Plotly.newPlot(\"{id}\", {}, {}, {{\"responsive\": true}});</script>",
        script_json(&Value::Array(traces)),
        script_json(&layout(encoding)),
    ))
}

/// Cluster rows by `features` and draw a choropleth colored by cluster. Too little data yields
/// a placeholder rather than an error.
pub fn cluster_map(
    table: &TabularResult,
    location: &str,
    features: &[&str],
    k: usize,
    title: &str,
    id: &str,
) -> Result<String> {
    match cluster::assign_clusters(table, features, k)? {
        Some(clustered) => render(
            &clustered,
            &Encoding::choropleth(location, title).with_color(crate::COL::CLUSTER),
            id,
        ),
        None => Ok(placeholder(id, "No data available for clustering.")),
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::warehouse::RowSet;
    use crate::COL;

    fn d(s: &str) -> Scalar {
        Scalar::Date(NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap())
    }

    fn table(columns: &[&str], rows: Vec<Vec<Scalar>>) -> TabularResult {
        TabularResult::from_rowset(
            columns,
            RowSet {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            },
        )
        .unwrap()
    }

    fn cases() -> TabularResult {
        table(
            &[COL::DATE, COL::COUNTRY, COL::TOTAL_CASES],
            vec![
                vec![d("2021-06-01"), Scalar::Text("Estonia".into()), Scalar::Int(130_000)],
                vec![d("2021-06-01"), Scalar::Text("Latvia".into()), Scalar::Int(150_000)],
                vec![d("2021-06-02"), Scalar::Text("Estonia".into()), Scalar::Int(130_200)],
                vec![d("2021-06-02"), Scalar::Text("Latvia".into()), Scalar::Int(150_100)],
            ],
        )
    }

    /// Pull the trace array out of a rendered fragment.
    fn traces(html: &str) -> Vec<Value> {
        let start = html.find(", [").unwrap() + 2;
        let mut stream = serde_json::Deserializer::from_str(&html[start..]).into_iter::<Value>();
        match stream.next().unwrap().unwrap() {
            Value::Array(traces) => traces,
            other => panic!("expected an array, got {other}"),
        }
    }

    #[test]
    fn colors_should_be_stable() {
        assert_eq!(stable_color("Latvia"), stable_color("Latvia"));
        assert!(PALETTE.contains(&stable_color("Estonia")));
    }

    #[test]
    fn line_chart_should_split_by_color() {
        let encoding = Encoding::line(COL::DATE, &[COL::TOTAL_CASES], "Countries with total cases over time")
            .with_color(COL::COUNTRY);
        let html = render(&cases(), &encoding, "total_cases_all_countries").unwrap();
        assert!(html.starts_with("<div id=\"total_cases_all_countries\""));
        let traces = traces(&html);
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0]["name"], "Estonia");
        assert_eq!(traces[0]["x"], json!(["2021-06-01", "2021-06-02"]));
        assert_eq!(traces[1]["y"], json!([150_000, 150_100]));
        assert_eq!(traces[1]["line"]["color"], stable_color("Latvia"));

        // Re-rendering keeps the same colors
        let again = render(&cases(), &encoding, "total_cases_all_countries").unwrap();
        assert_eq!(html, again);
    }

    #[test]
    fn bar_chart_should_draw_one_trace_per_series() {
        let mut rates = table(
            &[COL::DATE, COL::VACCINATED, COL::UNVACCINATED, COL::POPULATION],
            vec![
                vec![d("2021-06-01"), Scalar::Int(25), Scalar::Int(75), Scalar::Int(100)],
                vec![d("2021-06-02"), Scalar::Int(1), Scalar::Int(1), Scalar::Int(0)],
            ],
        );
        rates.derive_rate(COL::VACCINATION_RATE, COL::VACCINATED, COL::POPULATION).unwrap();
        rates.derive_rate(COL::UNVACCINATION_RATE, COL::UNVACCINATED, COL::POPULATION).unwrap();
        let encoding = Encoding::bar(COL::DATE, &[COL::VACCINATION_RATE, COL::UNVACCINATION_RATE], "Demographics")
            .with_labels(COL::DATE, "Percentage")
            .with_legend_title("Group");
        let html = render(&rates, &encoding, "vaccination_rates").unwrap();
        let traces = traces(&html);
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0]["name"], COL::VACCINATION_RATE);
        assert_eq!(traces[0]["y"], json!([25.0, null]));
        assert!(!html.contains("NaN") && !html.contains("Infinity"));
        assert!(html.contains("\"Percentage\""));
    }

    #[test]
    fn choropleth_should_skip_null_locations() {
        let countries = table(
            &[COL::COUNTRY],
            vec![
                vec![Scalar::Text("Latvia".into())],
                vec![Scalar::Null],
                vec![Scalar::Text("Narnia".into())],
            ],
        );
        let html = render(&countries, &Encoding::choropleth(COL::COUNTRY, "Countries"), "world_map").unwrap();
        let traces = traces(&html);
        assert_eq!(traces[0]["locations"], json!(["Latvia", "Narnia"]));
        assert_eq!(traces[0]["locationmode"], "country names");
    }

    #[test]
    fn script_should_not_close_early() {
        let countries = table(&[COL::COUNTRY], vec![vec![Scalar::Text("</script><b>".into())]]);
        let html = render(&countries, &Encoding::choropleth(COL::COUNTRY, "x"), "world_map").unwrap();
        assert_eq!(html.matches("</script>").count(), 1);
    }

    #[test]
    fn missing_columns_should_fail() {
        let encoding = Encoding::line(COL::DATE, &[COL::TOTAL_DEATH], "deaths");
        let err = render(&cases(), &encoding, "x").unwrap_err();
        assert!(matches!(err, CovidashError::DataIntegrity(_)));
    }

    #[test]
    fn empty_cluster_input_should_render_placeholder() {
        let empty = table(&[COL::COUNTRY, COL::TOTAL_CASES, COL::TOTAL_DEATH, COL::POPULATION], vec![]);
        let html = cluster_map(&empty, COL::COUNTRY, &cluster::FEATURES, 3, "Clusters", "clustering").unwrap();
        assert_eq!(
            html,
            "<div id=\"clustering\" class=\"chart-placeholder\"><p>No data available for clustering.</p></div>"
        );
    }

    #[test]
    fn cluster_map_should_color_by_cluster() {
        let snapshot = table(
            &[COL::COUNTRY, COL::TOTAL_CASES, COL::TOTAL_DEATH, COL::POPULATION],
            vec![
                vec![Scalar::Text("Austria".into()), Scalar::Int(650_000), Scalar::Int(10_700), Scalar::Int(8_900_000)],
                vec![Scalar::Text("Estonia".into()), Scalar::Int(130_000), Scalar::Int(1_260), Scalar::Int(1_330_000)],
                vec![Scalar::Text("Latvia".into()), Scalar::Int(150_000), Scalar::Int(2_490), Scalar::Int(1_900_000)],
            ],
        );
        let html = cluster_map(&snapshot, COL::COUNTRY, &cluster::FEATURES, 3, "Clusters", "clustering").unwrap();
        let traces = traces(&html);
        assert_eq!(traces.len(), 3);
        assert_eq!(traces[0]["name"], "CLUSTER 0");
    }

    #[test]
    fn placeholder_should_escape_message() {
        assert_eq!(
            placeholder("slot one", "<oops>"),
            "<div id=\"slotone\" class=\"chart-placeholder\"><p>&lt;oops&gt;</p></div>"
        );
    }
}
