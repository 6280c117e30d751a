#![cfg(not(tarpaulin_include))]

use crate::dashboard::{self, DeploymentFilter};
use crate::error::{AppError, Result};
use crate::models::ExecutionDetail;
use crate::query::Pagination;
use chrono::NaiveDateTime;
use sqlx::SqliteConnection;

/// Column titles of every deployment export, in order.
pub const EXPORT_HEADERS: [&str; 15] = [
    "Agent Name",
    "URN",
    "Retail Point Name",
    "Address",
    "Phone",
    "Retail Point Type",
    "State",
    "Table",
    "Chair",
    "Parasol",
    "Tarpaulin",
    "Hawker Jacket",
    "Cup",
    "Before Image",
    "After Image",
];

const IMAGE_COLUMNS: [usize; 2] = [13, 14];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Xlsx,
    Pdf,
}

impl ExportFormat {
    /// # Errors
    /// * `Validation` ("Invalid export type") for anything but csv, xlsx or pdf
    pub fn parse(value: &str) -> Result<ExportFormat> {
        match value.trim().to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "xlsx" => Ok(ExportFormat::Xlsx),
            "pdf" => Ok(ExportFormat::Pdf),
            _ => Err(AppError::validation("Invalid export type")),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Xlsx => "xlsx",
            ExportFormat::Pdf => "pdf",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            ExportFormat::Pdf => "application/pdf",
        }
    }

    pub fn file_name(&self) -> String {
        format!("posm_deployments.{}", self.extension())
    }
}

/// One line of a deployment export.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRow {
    pub agent_name: String,
    pub urn: String,
    pub outlet_name: String,
    pub address: String,
    pub phone: String,
    pub outlet_type: String,
    pub state: String,
    pub table: bool,
    pub chair: bool,
    pub parasol: bool,
    pub tarpaulin: bool,
    pub hawker_jacket: bool,
    pub cup: bool,
    pub before_image: String,
    pub after_image: String,
}

impl From<&ExecutionDetail> for DeploymentRow {
    fn from(detail: &ExecutionDetail) -> Self {
        let products = &detail.products;
        DeploymentRow {
            agent_name: detail.agent_name.clone(),
            urn: detail.urn.clone(),
            outlet_name: detail.outlet_name.clone(),
            address: detail.address.clone().unwrap_or_default(),
            phone: detail.phone.clone().unwrap_or_default(),
            outlet_type: detail.outlet_type.clone().unwrap_or_default(),
            state: detail.state.clone().unwrap_or_default(),
            table: products.is_available("Table"),
            chair: products.is_available("Chair"),
            parasol: products.is_available("Parasol"),
            tarpaulin: products.is_available("Tarpaulin"),
            hawker_jacket: products.is_available("Hawker Jacket"),
            // older records used the singular name
            cup: products.is_available("Cups") || products.is_available("Cup"),
            before_image: detail.before_image.clone().unwrap_or_default(),
            after_image: detail.after_image.clone().unwrap_or_default(),
        }
    }
}

fn yes_no(value: bool) -> String {
    let text = if value { "Yes" } else { "No" };
    text.to_string()
}

impl DeploymentRow {
    /// Cell texts in [`EXPORT_HEADERS`] order.
    pub fn cells(&self) -> [String; 15] {
        [
            self.agent_name.clone(),
            self.urn.clone(),
            self.outlet_name.clone(),
            self.address.clone(),
            self.phone.clone(),
            self.outlet_type.clone(),
            self.state.clone(),
            yes_no(self.table),
            yes_no(self.chair),
            yes_no(self.parasol),
            yes_no(self.tarpaulin),
            yes_no(self.hawker_jacket),
            yes_no(self.cup),
            self.before_image.clone(),
            self.after_image.clone(),
        ]
    }
}

/// Completed executions matching `filter`, newest first, capped at `limit`.
///
/// # Errors
/// * `NotFound` ("No data found for the selected filters") when nothing matches
pub async fn deployment_rows(
    conn: &mut SqliteConnection,
    filter: &DeploymentFilter,
    limit: u32,
    now: NaiveDateTime,
) -> Result<Vec<DeploymentRow>> {
    let page = dashboard::posm_deployments(conn, filter, Pagination::new(Some(1), limit), now).await?;
    if page.items.is_empty() {
        return Err(AppError::not_found("No data found for the selected filters"));
    }
    Ok(page.items.iter().map(DeploymentRow::from).collect())
}

/// Convert deployment rows to CSV
///
/// # Arguments
/// * `rows` - Rows to write below the header line
///
/// # Returns
/// * `Result<Vec<u8>>` - UTF-8 CSV content
pub fn to_csv(rows: &[DeploymentRow]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(EXPORT_HEADERS)?;
    for row in rows {
        writer.write_record(row.cells())?;
    }
    writer
        .into_inner()
        .map_err(|e| AppError::Export(e.to_string()))
}

/// Convert deployment rows to XLSX
///
/// The sheet is named "POSM Deployments". The header row is bold and wrapped,
/// white on blue with thin borders, and each column is as wide as its longest
/// value plus two characters.
///
/// # Arguments
/// * `rows` - Rows to write below the header line
///
/// # Returns
/// * `Result<Vec<u8>>` - XLSX file content
pub fn to_xlsx(rows: &[DeploymentRow]) -> Result<Vec<u8>> {
    use rust_xlsxwriter::{Color, Format, FormatAlign, FormatBorder, Workbook, Worksheet};

    let mut workbook = Workbook::new();
    let mut worksheet = Worksheet::new();
    worksheet.set_name("POSM Deployments")?;

    let header = Format::new()
        .set_bold()
        .set_text_wrap()
        .set_align(FormatAlign::Top)
        .set_background_color(Color::RGB(0x4472C4))
        .set_font_color(Color::White)
        .set_border(FormatBorder::Thin);

    let mut widths: Vec<usize> = EXPORT_HEADERS.iter().map(|h| h.chars().count()).collect();
    for (c, title) in EXPORT_HEADERS.iter().enumerate() {
        worksheet.write_string_with_format(0, c as u16, *title, &header)?;
    }
    for (r, row) in rows.iter().enumerate() {
        for (c, value) in row.cells().iter().enumerate() {
            worksheet.write_string((r + 1) as u32, c as u16, value)?;
            widths[c] = widths[c].max(value.chars().count());
        }
    }
    for (c, width) in widths.iter().enumerate() {
        worksheet.set_column_width(c as u16, (*width + 2) as f64)?;
    }

    workbook.push_worksheet(worksheet);
    let buffer = workbook.save_to_buffer()?;
    Ok(buffer)
}

mod pdf {
    use super::{DeploymentRow, EXPORT_HEADERS, IMAGE_COLUMNS};
    use crate::error::AppError;
    use printpdf::{
        BuiltinFont, Color, IndirectFontRef, Line, Mm, PdfDocument, PdfLayerReference,
        Point, Polygon, Rgb,
    };
    use printpdf::path::{PaintMode, WindingOrder};

    // Landscape A3
    const PAGE_WIDTH: f32 = 420.0;
    const PAGE_HEIGHT: f32 = 297.0;
    const MARGIN: f32 = 10.0;
    const ROW_HEIGHT: f32 = 6.0;
    const HEADER_HEIGHT: f32 = 8.0;
    const TITLE_HEIGHT: f32 = 12.0;
    const BODY_FONT: f32 = 6.0;
    const HEADER_FONT: f32 = 7.0;
    const PADDING: f32 = 1.2;
    /// Average Helvetica glyph width as a share of the font size, in mm per pt.
    const GLYPH_MM_PER_PT: f32 = 0.19;
    const MIN_WIDTH: f32 = 18.0;
    const MAX_WIDTH: f32 = 56.0;
    const IMAGE_WIDTH: f32 = 48.0;

    fn rgb(hex: u32) -> Color {
        let channel = |shift: u32| ((hex >> shift) & 0xff) as f32 / 255.0;
        Color::Rgb(Rgb::new(channel(16), channel(8), channel(0), None))
    }

    /// Column widths from the first twenty rows, scaled down to fit the page.
    fn column_widths(rows: &[Vec<String>]) -> Vec<f32> {
        let mut widths: Vec<f32> = EXPORT_HEADERS
            .iter()
            .enumerate()
            .map(|(c, title)| {
                if IMAGE_COLUMNS.contains(&c) {
                    return IMAGE_WIDTH;
                }
                let longest = rows
                    .iter()
                    .take(20)
                    .map(|row| row[c].chars().count())
                    .chain(std::iter::once(title.chars().count()))
                    .max()
                    .unwrap_or(0);
                (longest as f32 * BODY_FONT * GLYPH_MM_PER_PT + 2.0 * PADDING).clamp(MIN_WIDTH, MAX_WIDTH)
            })
            .collect();
        let available = PAGE_WIDTH - 2.0 * MARGIN;
        let total: f32 = widths.iter().sum();
        if total > available {
            for width in &mut widths {
                *width *= available / total;
            }
        }
        widths
    }

    /// Cut `text` so it fits `width` mm at `font_size`.
    fn fit(text: &str, width: f32, font_size: f32) -> String {
        let max_chars = ((width - 2.0 * PADDING) / (font_size * GLYPH_MM_PER_PT)).max(1.0) as usize;
        if text.chars().count() <= max_chars {
            return text.to_string();
        }
        let mut cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        cut.push_str("...");
        cut
    }

    fn fill_rect(layer: &PdfLayerReference, x: f32, y_top: f32, width: f32, height: f32, color: u32) {
        layer.set_fill_color(rgb(color));
        let corners = [
            (x, y_top),
            (x + width, y_top),
            (x + width, y_top - height),
            (x, y_top - height),
        ];
        layer.add_polygon(Polygon {
            rings: vec![
                corners
                    .iter()
                    .map(|&(px, py)| (Point::new(Mm(px), Mm(py)), false))
                    .collect(),
            ],
            mode: PaintMode::Fill,
            winding_order: WindingOrder::NonZero,
        });
    }

    fn grid_line(layer: &PdfLayerReference, from: (f32, f32), to: (f32, f32)) {
        layer.add_line(Line {
            points: vec![
                (Point::new(Mm(from.0), Mm(from.1)), false),
                (Point::new(Mm(to.0), Mm(to.1)), false),
            ],
            is_closed: false,
        });
    }

    struct Fonts {
        regular: IndirectFontRef,
        bold: IndirectFontRef,
    }

    fn header_row(layer: &PdfLayerReference, fonts: &Fonts, widths: &[f32], y_top: f32) {
        let table_width: f32 = widths.iter().sum();
        fill_rect(layer, MARGIN, y_top, table_width, HEADER_HEIGHT, 0x4472C4);
        layer.set_fill_color(rgb(0xFFFFFF));
        let mut x = MARGIN;
        for (title, width) in EXPORT_HEADERS.iter().zip(widths) {
            layer.use_text(
                fit(title, *width, HEADER_FONT),
                HEADER_FONT,
                Mm(x + PADDING),
                Mm(y_top - HEADER_HEIGHT + 2.5),
                &fonts.bold,
            );
            x += width;
        }
    }

    fn body_row(layer: &PdfLayerReference, fonts: &Fonts, widths: &[f32], cells: &[String], y_top: f32, shaded: bool) {
        let table_width: f32 = widths.iter().sum();
        if shaded {
            fill_rect(layer, MARGIN, y_top, table_width, ROW_HEIGHT, 0xF8F8F8);
        }
        layer.set_fill_color(rgb(0x000000));
        let mut x = MARGIN;
        for (cell, width) in cells.iter().zip(widths) {
            layer.use_text(
                fit(cell, *width, BODY_FONT),
                BODY_FONT,
                Mm(x + PADDING),
                Mm(y_top - ROW_HEIGHT + 2.0),
                &fonts.regular,
            );
            x += width;
        }
    }

    fn grid(layer: &PdfLayerReference, widths: &[f32], top: f32, bottom: f32, row_tops: &[f32]) {
        let table_width: f32 = widths.iter().sum();
        layer.set_outline_color(rgb(0xDDDDDD));
        layer.set_outline_thickness(0.25);
        for &y in row_tops.iter().chain(std::iter::once(&bottom)) {
            grid_line(layer, (MARGIN, y), (MARGIN + table_width, y));
        }
        let mut x = MARGIN;
        grid_line(layer, (x, top), (x, bottom));
        for width in widths {
            x += width;
            grid_line(layer, (x, top), (x, bottom));
        }
    }

    /// Lay the rows out as a table over as many pages as needed, repeating the
    /// header row on each page. Image cells hold `image_base` + file name.
    fn to_export(err: impl std::fmt::Display) -> AppError {
        AppError::Export(err.to_string())
    }

    pub fn render(rows: &[DeploymentRow], title: &str, image_base: &str) -> Result<Vec<u8>, AppError> {

        let cells: Vec<Vec<String>> = rows
            .iter()
            .map(|row| {
                let mut cells = row.cells().to_vec();
                for c in IMAGE_COLUMNS {
                    if !cells[c].is_empty() {
                        cells[c] = format!("{}{}", image_base, cells[c]);
                    }
                }
                cells
            })
            .collect();
        let widths = column_widths(&cells);

        let (doc, page, layer) = PdfDocument::new(title, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
        let fonts = Fonts {
            regular: doc.add_builtin_font(BuiltinFont::Helvetica).map_err(to_export)?,
            bold: doc.add_builtin_font(BuiltinFont::HelveticaBold).map_err(to_export)?,
        };

        let mut layer = doc.get_page(page).get_layer(layer);
        layer.set_fill_color(rgb(0x000000));
        layer.use_text(title, 12.0, Mm(MARGIN), Mm(PAGE_HEIGHT - MARGIN - 5.0), &fonts.bold);
        let mut table_top = PAGE_HEIGHT - MARGIN - TITLE_HEIGHT;

        let mut remaining = cells.iter().enumerate().peekable();
        while remaining.peek().is_some() {
            header_row(&layer, &fonts, &widths, table_top);
            let mut row_tops = vec![table_top, table_top - HEADER_HEIGHT];
            let mut y = table_top - HEADER_HEIGHT;
            while y - ROW_HEIGHT >= MARGIN {
                let Some((i, row)) = remaining.next() else {
                    break;
                };
                body_row(&layer, &fonts, &widths, row, y, i % 2 == 0);
                y -= ROW_HEIGHT;
                row_tops.push(y);
            }
            row_tops.pop();
            grid(&layer, &widths, table_top, y, &row_tops);

            if remaining.peek().is_some() {
                let (next_page, next_layer) = doc.add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
                layer = doc.get_page(next_page).get_layer(next_layer);
                table_top = PAGE_HEIGHT - MARGIN;
            }
        }

        doc.save_to_bytes().map_err(to_export)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn long_text_is_cut_to_width() {
            let text = "A very long retail point name that cannot fit";
            let cut = fit(text, 20.0, BODY_FONT);
            assert!(cut.ends_with("..."));
            assert!(cut.chars().count() < text.chars().count());
            assert_eq!(fit("Short", 20.0, BODY_FONT), "Short");
        }

        #[test]
        fn widths_fit_the_page() {
            let rows = vec![vec!["x".repeat(200); 15]];
            let widths = column_widths(&rows);
            let total: f32 = widths.iter().sum();
            assert!(total <= PAGE_WIDTH - 2.0 * MARGIN + 0.01);
        }
    }
}

/// Convert deployment rows to a landscape A3 PDF table
///
/// # Arguments
/// * `rows` - Rows to lay out
/// * `title` - Document title, printed above the table
/// * `image_base` - URL prefix for the before/after image columns
///
/// # Returns
/// * `Result<Vec<u8>>` - PDF file content
pub fn to_pdf(rows: &[DeploymentRow], title: &str, image_base: &str) -> Result<Vec<u8>> {
    pdf::render(rows, title, image_base)
}

/// Render `rows` in the requested format.
pub fn render(format: ExportFormat, rows: &[DeploymentRow], title: &str, image_base: &str) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Csv => to_csv(rows),
        ExportFormat::Xlsx => to_xlsx(rows),
        ExportFormat::Pdf => to_pdf(rows, title, image_base),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn row(name: &str) -> DeploymentRow {
        DeploymentRow {
            agent_name: "Tunde Ade".into(),
            urn: "DCP/22/SW/1".into(),
            outlet_name: name.into(),
            address: "12, Allen Avenue".into(),
            phone: "08012345678".into(),
            outlet_type: "Kiosk".into(),
            state: "LAGOS".into(),
            table: true,
            chair: false,
            parasol: true,
            tarpaulin: false,
            hawker_jacket: false,
            cup: true,
            before_image: "before_1.jpg".into(),
            after_image: String::new(),
        }
    }

    #[rstest]
    #[case("csv", ExportFormat::Csv)]
    #[case("XLSX", ExportFormat::Xlsx)]
    #[case(" pdf ", ExportFormat::Pdf)]
    fn formats_parse(#[case] input: &str, #[case] expected: ExportFormat) {
        assert_eq!(ExportFormat::parse(input).unwrap(), expected);
    }

    #[test]
    fn unknown_format_is_invalid() {
        let err = ExportFormat::parse("docx").unwrap_err();
        assert_eq!(err.to_string(), "Invalid export type");
        assert_eq!(ExportFormat::Xlsx.file_name(), "posm_deployments.xlsx");
    }

    #[test]
    fn csv_has_headers_in_order_and_quotes_commas() {
        let bytes = to_csv(&[row("Mama Put")]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), EXPORT_HEADERS.join(","));
        assert_eq!(
            lines.next().unwrap(),
            "Tunde Ade,DCP/22/SW/1,Mama Put,\"12, Allen Avenue\",08012345678,Kiosk,LAGOS,Yes,No,Yes,No,No,Yes,before_1.jpg,"
        );
    }

    #[test]
    fn xlsx_is_a_zip_archive() {
        let bytes = to_xlsx(&[row("Mama Put")]).unwrap();
        assert_eq!(&bytes[..2], b"PK");
    }

    #[test]
    fn pdf_spans_pages() {
        let rows: Vec<DeploymentRow> = (0..120).map(|i| row(&format!("Outlet {}", i))).collect();
        let bytes = to_pdf(&rows, "POSM Deployments", "/static/uploads/").unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn empty_selection_is_not_found() {
        let pool = crate::db::connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let err = deployment_rows(&mut conn, &DeploymentFilter::default(), 1000, crate::models::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
