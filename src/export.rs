use crate::mailer::{MailError, MailTransport};
use crate::model::DailyReport;
use crate::template::{Template, TemplateError};
use chrono::{DateTime, Utc};
use rust_xlsxwriter::{Format, Workbook, Worksheet, XlsxError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

const HEADERS: [&str; 5] = ["Server ID", "Server Name", "Address", "Status", "Uptime (%)"];
const COLUMN_WIDTHS: [f64; 5] = [18.0, 28.0, 24.0, 10.0, 12.0];

#[derive(Debug, Error)]
pub enum SaveError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Workbook(#[from] XlsxError),
    #[error("export task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to save spreadsheet in {dir}: {source}")]
    Save {
        dir: String,
        #[source]
        source: SaveError,
    },
    #[error("failed to read email template {path}: {source}")]
    TemplateRead {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse email template: {0}")]
    TemplateParse(#[source] TemplateError),
    #[error("failed to render email template: {0}")]
    TemplateExecute(#[source] TemplateError),
    #[error("failed to send email: {0}")]
    Send(#[source] MailError),
}

impl ExportError {
    /// Short stage name, used as a metrics label.
    pub fn stage(&self) -> &'static str {
        match self {
            ExportError::Save { .. } => "save",
            ExportError::TemplateRead { .. } => "template_read",
            ExportError::TemplateParse(_) => "template_parse",
            ExportError::TemplateExecute(_) => "template_execute",
            ExportError::Send(_) => "send",
        }
    }
}

/// Turns a finished report into a spreadsheet and, optionally, an email.
#[derive(Clone)]
pub struct ReportExporter {
    export_dir: PathBuf,
    template_path: PathBuf,
    mailer: Arc<dyn MailTransport>,
}

impl ReportExporter {
    pub fn new(
        export_dir: impl Into<PathBuf>,
        template_path: impl Into<PathBuf>,
        mailer: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            export_dir: export_dir.into(),
            template_path: template_path.into(),
            mailer,
        }
    }

    /// Writes `<export_dir>/daily_report_<YYYYMMDD>_<unix>_<random>.xlsx` and
    /// returns its path. The file is created exclusively, so concurrent
    /// exports never share a path.
    pub async fn export_to_spreadsheet(&self, report: &DailyReport) -> Result<PathBuf, ExportError> {
        let prefix = format!(
            "daily_report_{}_{}_",
            report.start.format("%Y%m%d"),
            Utc::now().timestamp()
        );
        let report = report.clone();
        let dir = self.export_dir.clone();

        let saved = tokio::task::spawn_blocking(move || -> Result<PathBuf, SaveError> {
            std::fs::create_dir_all(&dir)?;
            let (file, path) = tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(".xlsx")
                .tempfile_in(&dir)?
                .keep()
                .map_err(|err| err.error)?;
            drop(file);
            if let Err(err) = write_workbook(&report, &path) {
                let _ = std::fs::remove_file(&path);
                return Err(err.into());
            }
            Ok(path)
        })
        .await
        .map_err(SaveError::from)
        .and_then(|result| result);

        match saved {
            Ok(path) => {
                info!(path = %path.display(), bytes = file_len(&path), "spreadsheet exported");
                Ok(path)
            }
            Err(source) => Err(ExportError::Save {
                dir: self.export_dir.display().to_string(),
                source,
            }),
        }
    }

    /// Export, render the email template and hand both to the mail transport.
    /// Each stage fails with its own `ExportError` variant.
    pub async fn send_by_email(
        &self,
        report: &DailyReport,
        recipient: &str,
        subject: &str,
    ) -> Result<PathBuf, ExportError> {
        let path = self.export_to_spreadsheet(report).await?;

        let source = tokio::fs::read_to_string(&self.template_path)
            .await
            .map_err(|source| ExportError::TemplateRead {
                path: self.template_path.display().to_string(),
                source,
            })?;
        let template = Template::parse(&source).map_err(ExportError::TemplateParse)?;
        let html = template
            .execute(report, Utc::now())
            .map_err(ExportError::TemplateExecute)?;

        if let Err(err) = self
            .mailer
            .send(recipient, subject, &html, Some(&path))
            .await
        {
            warn!(recipient = %recipient, error = %err, "report email delivery failed");
            return Err(ExportError::Send(err));
        }

        info!(recipient = %recipient, subject = %subject, "report email sent");
        Ok(path)
    }
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn write_workbook(report: &DailyReport, path: &Path) -> Result<(), XlsxError> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Server Report")?;

    let header = Format::new().set_bold();
    let percent = Format::new().set_num_format("0.00");

    for (col, (title, width)) in HEADERS.iter().zip(COLUMN_WIDTHS).enumerate() {
        let col = col as u16;
        sheet.write_string_with_format(0, col, *title, &header)?;
        sheet.set_column_width(col, width)?;
    }

    let mut row: u32 = 1;
    for record in &report.detail {
        sheet.write_string(row, 0, record.server.server_id.as_str())?;
        sheet.write_string(row, 1, record.server.server_name.as_str())?;
        sheet.write_string(row, 2, record.server.address.as_str())?;
        sheet.write_string(row, 3, record.server.status.as_str())?;
        sheet.write_number_with_format(row, 4, record.uptime_percent, &percent)?;
        row += 1;
    }

    write_summary(sheet, row + 1, report, &header, &percent)?;
    workbook.save(path)?;
    Ok(())
}

fn write_summary(
    sheet: &mut Worksheet,
    first_row: u32,
    report: &DailyReport,
    label: &Format,
    percent: &Format,
) -> Result<(), XlsxError> {
    let window = |ts: DateTime<Utc>| ts.format("%Y-%m-%d %H:%M:%S UTC").to_string();

    sheet.write_string_with_format(first_row, 0, "Window Start", label)?;
    sheet.write_string(first_row, 1, window(report.start))?;
    sheet.write_string_with_format(first_row + 1, 0, "Window End", label)?;
    sheet.write_string(first_row + 1, 1, window(report.end))?;
    sheet.write_string_with_format(first_row + 2, 0, "Total Servers", label)?;
    sheet.write_number(first_row + 2, 1, report.total_servers as f64)?;
    sheet.write_string_with_format(first_row + 3, 0, "Online", label)?;
    sheet.write_number(first_row + 3, 1, report.online_count as f64)?;
    sheet.write_string_with_format(first_row + 4, 0, "Offline", label)?;
    sheet.write_number(first_row + 4, 1, report.offline_count as f64)?;
    sheet.write_string_with_format(first_row + 5, 0, "Average Uptime (%)", label)?;
    sheet.write_number_with_format(first_row + 5, 1, report.avg_uptime_percent, percent)?;
    Ok(())
}
