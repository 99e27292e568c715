use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Report,
    InvestigationReport,
    AuditReport,
    Letter,
    OfficialLetter,
    ComplaintLetter,
    Policy,
    Law,
    Regulation,
    Guideline,
    CourtCase,
    CourtOrder,
    Judgment,
    Contract,
    Agreement,
    Mou,
    MeetingMinutes,
    Announcement,
    PressRelease,
    BudgetDocument,
    FinancialStatement,
    Other,
}

impl DocumentType {
    pub const ALL: &'static [DocumentType] = &[
        DocumentType::Report,
        DocumentType::InvestigationReport,
        DocumentType::AuditReport,
        DocumentType::Letter,
        DocumentType::OfficialLetter,
        DocumentType::ComplaintLetter,
        DocumentType::Policy,
        DocumentType::Law,
        DocumentType::Regulation,
        DocumentType::Guideline,
        DocumentType::CourtCase,
        DocumentType::CourtOrder,
        DocumentType::Judgment,
        DocumentType::Contract,
        DocumentType::Agreement,
        DocumentType::Mou,
        DocumentType::MeetingMinutes,
        DocumentType::Announcement,
        DocumentType::PressRelease,
        DocumentType::BudgetDocument,
        DocumentType::FinancialStatement,
        DocumentType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Report => "report",
            DocumentType::InvestigationReport => "investigation_report",
            DocumentType::AuditReport => "audit_report",
            DocumentType::Letter => "letter",
            DocumentType::OfficialLetter => "official_letter",
            DocumentType::ComplaintLetter => "complaint_letter",
            DocumentType::Policy => "policy",
            DocumentType::Law => "law",
            DocumentType::Regulation => "regulation",
            DocumentType::Guideline => "guideline",
            DocumentType::CourtCase => "court_case",
            DocumentType::CourtOrder => "court_order",
            DocumentType::Judgment => "judgment",
            DocumentType::Contract => "contract",
            DocumentType::Agreement => "agreement",
            DocumentType::Mou => "mou",
            DocumentType::MeetingMinutes => "meeting_minutes",
            DocumentType::Announcement => "announcement",
            DocumentType::PressRelease => "press_release",
            DocumentType::BudgetDocument => "budget_document",
            DocumentType::FinancialStatement => "financial_statement",
            DocumentType::Other => "other",
        }
    }
}

/// Document-level facts from the metadata extraction call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub publication_date: Option<NaiveDate>,
    pub document_type: Option<DocumentType>,
    pub source: Option<String>,
}

/// Parse the date forms the model is asked for: `YYYY-MM-DD`, `YYYY-MM` or `YYYY`.
/// Partial dates resolve to the first day of the period.
pub fn parse_publication_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(&format!("{}-01", value), "%Y-%m-%d") {
        return Some(date);
    }
    if value.len() == 4 {
        let year = value.parse::<i32>().ok()?;
        return NaiveDate::from_ymd_opt(year, 1, 1);
    }
    None
}
