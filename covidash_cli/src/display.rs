use comfy_table::{presets::NOTHING, *};
use covidash::catalog::CatalogTable;
use covidash::comments::Comment;
use covidash::table::TabularResult;
use itertools::Itertools;
use serde_json::Value;

fn styled_table<I, S>(header: I) -> Table
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            header
                .into_iter()
                .map(|h| Cell::new(h.into()).add_attribute(Attribute::Bold))
                .collect_vec(),
        )
        .set_style(comfy_table::TableComponent::BottomBorder, '─')
        .set_style(comfy_table::TableComponent::MiddleHeaderIntersections, '─')
        .set_style(comfy_table::TableComponent::HeaderLines, '─')
        .set_style(comfy_table::TableComponent::BottomBorderIntersections, '─')
        .set_style(comfy_table::TableComponent::TopBorder, '─')
        .set_style(comfy_table::TableComponent::TopBorderIntersections, '─');
    table
}

/// Text shown in a cell: strings unquoted, undefined values blank.
fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn display_table(result: &TabularResult) -> anyhow::Result<()> {
    let mut table = styled_table(result.column_names());
    for row in result.to_rows()? {
        table.add_row(row.iter().map(cell_text).collect_vec());
    }
    println!("\n{}", table);
    println!("{} rows", result.height());
    Ok(())
}

pub fn display_tables(database: &str, tables: &[CatalogTable]) {
    let mut table = styled_table(["Database", "Table"]);
    for t in tables {
        table.add_row(vec![database.to_string(), t.to_string()]);
    }
    println!("\n{}", table);
}

pub fn display_comments(comments: &[Comment]) {
    if comments.is_empty() {
        println!("No comments");
        return;
    }
    let mut table = styled_table(["Timestamp", "User", "Comment"]);
    for comment in comments {
        table.add_row(vec![
            comment.timestamp.to_rfc3339(),
            comment.user.clone(),
            comment.text.clone(),
        ]);
    }
    println!("\n{}", table);
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn cells_should_render_plain_text() {
        assert_eq!(cell_text(&json!("Latvia")), "Latvia");
        assert_eq!(cell_text(&json!(31.25)), "31.25");
        assert_eq!(cell_text(&Value::Null), "");
    }
}
