//! Renders a realized-PL chart from previously recorded transaction
//! history (CSV/TSV file or SQLite database).

use chrono::{DateTime, Utc};
use oanda_core::DataError;
use plotters::coord::Shift;
use plotters::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum PlotError {
    #[error("data error: {0}")]
    Data(#[from] DataError),
    #[error("unsupported data file extension: {0}")]
    UnsupportedExtension(String),
    #[error("no order fill transactions found in {0}")]
    NoData(String),
    #[error("render error: {0}")]
    Render(String),
}

/// One order fill extracted from the transaction history.
#[derive(Debug, Clone, PartialEq)]
pub struct PlPoint {
    pub time: DateTime<Utc>,
    pub instrument: String,
    pub pl: f64,
    pub account_balance: f64,
    pub initial_margin: Option<f64>,
}

fn json_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Keep the transactions that carry both an account balance and an
/// instrument (order fills), in time order.
pub fn extract_pl_points(rows: &[String]) -> Vec<PlPoint> {
    let mut points: Vec<PlPoint> = rows
        .iter()
        .filter_map(|row| {
            let value: Value = serde_json::from_str(row).ok()?;
            let instrument = value.get("instrument")?.as_str()?.to_string();
            let account_balance = json_number(value.get("accountBalance")?)?;
            let time = value
                .get("time")?
                .as_str()?
                .parse::<DateTime<Utc>>()
                .ok()?;
            let pl = value.get("pl").and_then(json_number).unwrap_or(0.0);
            let initial_margin = value
                .get("tradeOpened")
                .and_then(|t| t.get("initialMarginRequired"))
                .and_then(json_number);
            Some(PlPoint {
                time,
                instrument,
                pl,
                account_balance,
                initial_margin,
            })
        })
        .collect();
    points.sort_by_key(|p| p.time);
    points
}

/// Running PL total per instrument, in time order.
pub fn cumulative_pl(points: &[PlPoint]) -> BTreeMap<String, Vec<(DateTime<Utc>, f64)>> {
    let mut series: BTreeMap<String, Vec<(DateTime<Utc>, f64)>> = BTreeMap::new();
    let mut totals: BTreeMap<String, f64> = BTreeMap::new();
    for point in points {
        let total = totals.entry(point.instrument.clone()).or_insert(0.0);
        *total += point.pl;
        series
            .entry(point.instrument.clone())
            .or_default()
            .push((point.time, *total));
    }
    series
}

/// Read transaction history from `data_path` (by extension) and render
/// the chart to `graph_path` (SVG when it ends in `.svg`, bitmap
/// otherwise).
pub async fn read_and_plot_pl(data_path: &Path, graph_path: &Path) -> Result<(), PlotError> {
    let extension = data_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let rows = match extension.as_str() {
        "csv" | "tsv" | "txt" => oanda_data::read_transaction_json_csv(data_path)?,
        "sqlite3" | "sqlite" | "db" => {
            let pool = oanda_data::open_database(data_path).await?;
            let rows = oanda_data::read_transaction_json(&pool).await?;
            pool.close().await;
            rows
        }
        other => return Err(PlotError::UnsupportedExtension(other.to_string())),
    };
    let points = extract_pl_points(&rows);
    if points.is_empty() {
        return Err(PlotError::NoData(data_path.display().to_string()));
    }
    plot_pl(&points, graph_path)
}

/// Render already-extracted points to `graph_path`.
pub fn plot_pl(points: &[PlPoint], graph_path: &Path) -> Result<(), PlotError> {
    if points.is_empty() {
        return Err(PlotError::NoData("in-memory transaction set".to_string()));
    }
    info!(points = points.len(), graph = %graph_path.display(), "rendering PL chart");
    render_pl_chart(points, graph_path)
}

const CHART_SIZE: (u32, u32) = (1280, 960);

fn render_pl_chart(points: &[PlPoint], graph_path: &Path) -> Result<(), PlotError> {
    let is_svg = graph_path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("svg"));
    if is_svg {
        let root = SVGBackend::new(graph_path, CHART_SIZE).into_drawing_area();
        draw_panels(&root, points)?;
        root.present().map_err(|e| PlotError::Render(e.to_string()))
    } else {
        let root = BitMapBackend::new(graph_path, CHART_SIZE).into_drawing_area();
        draw_panels(&root, points)?;
        root.present().map_err(|e| PlotError::Render(e.to_string()))
    }
}

fn value_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in values {
        min = min.min(v);
        max = max.max(v);
    }
    if !min.is_finite() {
        return (0.0, 1.0);
    }
    if (max - min).abs() < f64::EPSILON {
        (min - 1.0, max + 1.0)
    } else {
        let pad = (max - min) * 0.05;
        (min - pad, max + pad)
    }
}

fn draw_panels<DB>(root: &DrawingArea<DB, Shift>, points: &[PlPoint]) -> Result<(), PlotError>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    root.fill(&WHITE)
        .map_err(|e| PlotError::Render(e.to_string()))?;
    let panels = root.split_evenly((3, 1));

    let t_min = points[0].time;
    let t_max = points[points.len() - 1].time;
    let series = cumulative_pl(points);

    // Panel 1: cumulative PL per instrument.
    let (pl_min, pl_max) = value_range(series.values().flatten().map(|(_, v)| *v));
    let mut chart = ChartBuilder::on(&panels[0])
        .caption("Cumulative PL", ("sans-serif", 24))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(60)
        .build_cartesian_2d(t_min..t_max, pl_min..pl_max)
        .map_err(|e| PlotError::Render(e.to_string()))?;
    chart
        .configure_mesh()
        .draw()
        .map_err(|e| PlotError::Render(e.to_string()))?;
    for (idx, (instrument, line)) in series.iter().enumerate() {
        let color = Palette99::pick(idx);
        chart
            .draw_series(LineSeries::new(line.iter().copied(), color.stroke_width(2)))
            .map_err(|e| PlotError::Render(e.to_string()))?
            .label(instrument)
            .legend(move |(x, y)| {
                PathElement::new(vec![(x, y), (x + 16, y)], Palette99::pick(idx).stroke_width(2))
            });
    }
    chart
        .configure_series_labels()
        .border_style(BLACK)
        .background_style(WHITE.mix(0.8))
        .draw()
        .map_err(|e| PlotError::Render(e.to_string()))?;

    // Panel 2: account balance.
    let (bal_min, bal_max) = value_range(points.iter().map(|p| p.account_balance));
    let mut chart = ChartBuilder::on(&panels[1])
        .caption("Account Balance", ("sans-serif", 24))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(60)
        .build_cartesian_2d(t_min..t_max, bal_min..bal_max)
        .map_err(|e| PlotError::Render(e.to_string()))?;
    chart
        .configure_mesh()
        .draw()
        .map_err(|e| PlotError::Render(e.to_string()))?;
    chart
        .draw_series(
            AreaSeries::new(
                points.iter().map(|p| (p.time, p.account_balance)),
                bal_min,
                BLUE.mix(0.2),
            )
            .border_style(BLUE.stroke_width(2)),
        )
        .map_err(|e| PlotError::Render(e.to_string()))?;

    // Panel 3: initial margin required by opened trades.
    let margin_points: Vec<(DateTime<Utc>, f64)> = points
        .iter()
        .filter_map(|p| p.initial_margin.map(|m| (p.time, m)))
        .collect();
    let (m_min, m_max) = value_range(margin_points.iter().map(|(_, m)| *m));
    let mut chart = ChartBuilder::on(&panels[2])
        .caption("Initial Margin Required", ("sans-serif", 24))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(60)
        .build_cartesian_2d(t_min..t_max, m_min.min(0.0)..m_max)
        .map_err(|e| PlotError::Render(e.to_string()))?;
    chart
        .configure_mesh()
        .draw()
        .map_err(|e| PlotError::Render(e.to_string()))?;
    chart
        .draw_series(
            margin_points
                .iter()
                .map(|(t, m)| Circle::new((*t, *m), 3, RED.filled())),
        )
        .map_err(|e| PlotError::Render(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(time: &str, instrument: &str, pl: &str, balance: &str) -> String {
        format!(
            r#"{{"id":"1","type":"ORDER_FILL","time":"{time}","instrument":"{instrument}","pl":"{pl}","accountBalance":"{balance}","tradeOpened":{{"initialMarginRequired":"33.2"}}}}"#
        )
    }

    #[test]
    fn test_extract_skips_rows_without_balance_or_instrument() {
        let rows = vec![
            fill("2024-05-01T00:00:00Z", "EUR_USD", "1.5", "1001.5"),
            r#"{"id":"2","type":"ORDER","time":"2024-05-01T00:00:01Z"}"#.to_string(),
            r#"{"id":"3","type":"DAILY_FINANCING","time":"2024-05-01T00:00:02Z","accountBalance":"1001.4"}"#.to_string(),
            "not json".to_string(),
        ];
        let points = extract_pl_points(&rows);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].instrument, "EUR_USD");
        assert_eq!(points[0].pl, 1.5);
        assert_eq!(points[0].initial_margin, Some(33.2));
    }

    #[test]
    fn test_extract_sorts_by_time() {
        let rows = vec![
            fill("2024-05-01T00:00:10Z", "EUR_USD", "2.0", "1002.0"),
            fill("2024-05-01T00:00:00Z", "EUR_USD", "1.0", "1000.0"),
        ];
        let points = extract_pl_points(&rows);
        assert!(points[0].time < points[1].time);
        assert_eq!(points[0].pl, 1.0);
    }

    #[test]
    fn test_cumulative_pl_runs_per_instrument() {
        let rows = vec![
            fill("2024-05-01T00:00:00Z", "EUR_USD", "1.0", "1001.0"),
            fill("2024-05-01T00:00:01Z", "USD_JPY", "-0.5", "1000.5"),
            fill("2024-05-01T00:00:02Z", "EUR_USD", "2.0", "1002.5"),
        ];
        let series = cumulative_pl(&extract_pl_points(&rows));
        assert_eq!(series["EUR_USD"].last().unwrap().1, 3.0);
        assert_eq!(series["USD_JPY"].last().unwrap().1, -0.5);
    }

    #[tokio::test]
    async fn test_unknown_extension_is_rejected() {
        let err = read_and_plot_pl(Path::new("history.parquet"), Path::new("out.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlotError::UnsupportedExtension(e) if e == "parquet"));
    }
}
