//! 引用校验：清洗 oracle 返回的图纸编号与规范章节号
//!
//! 校验是纯函数，不修改输入，可在多个批次之间并发共享。

use phf::phf_map;
use regex::{Regex, RegexSet};

use crate::models::{MatchOutcome, ReferenceDiagnostics};

/// CSI MasterFormat 分部（00-49）
static CSI_DIVISIONS: phf::Map<&'static str, &'static str> = phf_map! {
    "00" => "Procurement and Contracting Requirements",
    "01" => "General Requirements",
    "02" => "Existing Conditions",
    "03" => "Concrete",
    "04" => "Masonry",
    "05" => "Metals",
    "06" => "Wood, Plastics, and Composites",
    "07" => "Thermal and Moisture Protection",
    "08" => "Openings",
    "09" => "Finishes",
    "10" => "Specialties",
    "11" => "Equipment",
    "12" => "Furnishings",
    "13" => "Special Construction",
    "14" => "Conveying Equipment",
    "15" => "Reserved",
    "16" => "Reserved",
    "17" => "Reserved",
    "18" => "Reserved",
    "19" => "Reserved",
    "20" => "Reserved",
    "21" => "Fire Suppression",
    "22" => "Plumbing",
    "23" => "HVAC",
    "24" => "Reserved",
    "25" => "Integrated Automation",
    "26" => "Electrical",
    "27" => "Communications",
    "28" => "Electronic Safety and Security",
    "29" => "Reserved",
    "30" => "Reserved",
    "31" => "Earthwork",
    "32" => "Exterior Improvements",
    "33" => "Utilities",
    "34" => "Transportation",
    "35" => "Waterway and Marine Construction",
    "36" => "Reserved",
    "37" => "Reserved",
    "38" => "Reserved",
    "39" => "Reserved",
    "40" => "Process Integration",
    "41" => "Material Processing and Handling Equipment",
    "42" => "Process Heating, Cooling, and Drying Equipment",
    "43" => "Process Gas and Liquid Storage, Conditioning, and Disposal Equipment",
    "44" => "Pollution and Waste Control Equipment",
    "45" => "Industry-Specific Manufacturing Equipment",
    "46" => "Water and Wastewater Equipment",
    "47" => "Reserved",
    "48" => "Electrical Power Generation and Transmission Equipment",
    "49" => "Reserved",
};

const SHEET_PATTERNS: [&str; 5] = [
    r"^[A-Z]\d+\.\d+$",  // A1.1
    r"^[A-Z]-\d+$",      // A-01
    r"^[A-Z]\d+$",       // A1
    r"^[A-Z]{2,}-\d+$",  // ARCH-01
    r"^\d+$",            // 12
];

const SPEC_PATTERNS: [&str; 3] = [
    r"^\d{2}\s\d{2}\s\d{2}$", // 03 30 00
    r"^\d{2}\.\d{2}\.\d{2}$", // 03.30.00
    r"^\d{2}-\d{2}-\d{2}$",   // 03-30-00
];

const EXACT_SHEET_CONFIDENCE: f64 = 0.9;
const CORRECTED_SHEET_CONFIDENCE: f64 = 0.7;
const EXACT_SPEC_CONFIDENCE: f64 = 0.95;
const CORRECTED_SPEC_CONFIDENCE: f64 = 0.8;

/// 分部编号对应的名称
pub fn division_name(code: &str) -> Option<&'static str> {
    CSI_DIVISIONS.get(code).copied()
}

/// 单条引用的校验结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Exact,
    Corrected,
    Invalid,
}

/// 单条引用的校验结果
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceCheck {
    pub original: String,
    /// 校验通过后的规范写法，无效时为 None
    pub value: Option<String>,
    pub kind: CheckKind,
    pub confidence: f64,
}

impl ReferenceCheck {
    fn exact(original: &str, value: String, confidence: f64) -> Self {
        Self {
            original: original.to_string(),
            value: Some(value),
            kind: CheckKind::Exact,
            confidence,
        }
    }

    fn corrected(original: &str, value: String, confidence: f64) -> Self {
        Self {
            original: original.to_string(),
            value: Some(value),
            kind: CheckKind::Corrected,
            confidence,
        }
    }

    fn invalid(original: &str) -> Self {
        Self {
            original: original.to_string(),
            value: None,
            kind: CheckKind::Invalid,
            confidence: 0.0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.kind != CheckKind::Invalid
    }
}

/// 校验后的结果及诊断信息
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedOutcome {
    pub outcome: MatchOutcome,
    pub diagnostics: ReferenceDiagnostics,
}

/// 引用校验器
#[derive(Debug, Clone)]
pub struct ReferenceValidator {
    sheet_patterns: RegexSet,
    spec_patterns: RegexSet,
    sheet_missing_dash: Regex,
}

impl ReferenceValidator {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            sheet_patterns: RegexSet::new(SHEET_PATTERNS)?,
            spec_patterns: RegexSet::new(SPEC_PATTERNS)?,
            sheet_missing_dash: Regex::new(r"^([A-Z])(\d{2,})$")?,
        })
    }

    /// 校验单个图纸编号
    pub fn validate_sheet_number(&self, raw: &str) -> ReferenceCheck {
        let cleaned = raw.trim().to_uppercase();
        if cleaned.is_empty() {
            return ReferenceCheck::invalid(raw);
        }
        if self.sheet_patterns.is_match(&cleaned) {
            return ReferenceCheck::exact(raw, cleaned, EXACT_SHEET_CONFIDENCE);
        }

        match self.correct_sheet_number(&cleaned) {
            Some(corrected) if corrected != cleaned => {
                ReferenceCheck::corrected(raw, corrected, CORRECTED_SHEET_CONFIDENCE)
            }
            _ => ReferenceCheck::invalid(raw),
        }
    }

    /// 校验单个规范章节号（分部必须在 00-49 之间）
    pub fn validate_spec_section(&self, raw: &str) -> ReferenceCheck {
        let cleaned = raw.trim();
        if cleaned.is_empty() {
            return ReferenceCheck::invalid(raw);
        }
        if self.is_valid_spec(cleaned) {
            return ReferenceCheck::exact(raw, cleaned.to_string(), EXACT_SPEC_CONFIDENCE);
        }

        match correct_spec_section(cleaned) {
            Some(corrected) if corrected != cleaned && self.is_valid_spec(&corrected) => {
                ReferenceCheck::corrected(raw, corrected, CORRECTED_SPEC_CONFIDENCE)
            }
            _ => ReferenceCheck::invalid(raw),
        }
    }

    /// 校验并修正一个匹配结果的全部引用
    ///
    /// 无法修正的引用被丢弃，只要丢弃了任何引用，HIGH 降为 MEDIUM。
    pub fn validate(&self, outcome: &MatchOutcome) -> ValidatedOutcome {
        let sheet_checks: Vec<ReferenceCheck> = outcome
            .sheet_references
            .iter()
            .map(|r| self.validate_sheet_number(r))
            .collect();
        let spec_checks: Vec<ReferenceCheck> = outcome
            .spec_references
            .iter()
            .map(|r| self.validate_spec_section(r))
            .collect();

        let dropped_references: Vec<String> = sheet_checks
            .iter()
            .chain(spec_checks.iter())
            .filter(|c| !c.is_valid())
            .map(|c| c.original.clone())
            .collect();

        let sheet_confidence = group_confidence(&sheet_checks);
        let spec_confidence = group_confidence(&spec_checks);

        let mut corrected = outcome.clone();
        corrected.sheet_references = collect_unique(&sheet_checks);
        corrected.spec_references = collect_unique(&spec_checks);
        if !dropped_references.is_empty() {
            corrected.confidence = corrected.confidence.downgraded();
        }

        ValidatedOutcome {
            outcome: corrected,
            diagnostics: ReferenceDiagnostics {
                row_id: outcome.row_id,
                sheet_confidence,
                spec_confidence,
                overall_confidence: (sheet_confidence + spec_confidence) / 2.0,
                dropped_references,
            },
        }
    }

    fn is_valid_spec(&self, section: &str) -> bool {
        self.spec_patterns.is_match(section)
            && section
                .get(..2)
                .map(|division| CSI_DIVISIONS.contains_key(division))
                .unwrap_or(false)
    }

    fn correct_sheet_number(&self, cleaned: &str) -> Option<String> {
        let compact: String = cleaned
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| match c {
                '_' | '–' | '—' => '-',
                other => other,
            })
            .collect();

        if let Some(caps) = self.sheet_missing_dash.captures(&compact) {
            return Some(format!("{}-{}", &caps[1], &caps[2]));
        }
        if self.sheet_patterns.is_match(&compact) {
            return Some(compact);
        }
        None
    }
}

/// 只含 6 位数字（允许夹杂空白和分隔符）时整理为 `DD DD DD`
fn correct_spec_section(cleaned: &str) -> Option<String> {
    let digits: String = cleaned
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '.' | '-' | '_'))
        .collect();

    if digits.len() == 6 && digits.chars().all(|c| c.is_ascii_digit()) {
        Some(format!("{} {} {}", &digits[..2], &digits[2..4], &digits[4..]))
    } else {
        None
    }
}

fn group_confidence(checks: &[ReferenceCheck]) -> f64 {
    if checks.is_empty() {
        return 0.0;
    }
    checks.iter().map(|c| c.confidence).sum::<f64>() / checks.len() as f64
}

/// 保留有效引用，重复项只保留第一次出现
fn collect_unique(checks: &[ReferenceCheck]) -> Vec<String> {
    let mut values: Vec<String> = Vec::with_capacity(checks.len());
    for value in checks.iter().filter_map(|c| c.value.as_ref()) {
        if !values.contains(value) {
            values.push(value.clone());
        }
    }
    values
}
