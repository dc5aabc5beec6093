use crate::column::{ColumnId, ColumnRef, ColumnRole};
use crate::ClassificationMode;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fmt, fs, path::Path, path::PathBuf, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// 借贷方分开
    Separate,
    /// 借贷方在一起
    Together,
}

/// Treatment of credit amounts in `together` mode. Does not affect counterparty text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum CreditAction {
    #[default]
    #[serde(rename = "直接等于", alias = "as-is")]
    AsIs,
    #[serde(rename = "取相反数", alias = "negate")]
    Negate,
}

impl FromStr for CreditAction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "直接等于" | "as-is" => Ok(CreditAction::AsIs),
            "取相反数" | "negate" => Ok(CreditAction::Negate),
            other => Err(ConfigError::InvalidValue { field: "credit_action", value: other.to_string() }),
        }
    }
}

impl fmt::Display for CreditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CreditAction::AsIs => "直接等于",
            CreditAction::Negate => "取相反数",
        })
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("必填字段不能为空: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("字段 {field} 的取值无效: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Mode-specific column references.
#[derive(Debug, Clone, PartialEq)]
pub enum ModeSettings {
    Separate { debit_col: ColumnRef, credit_col: ColumnRef },
    Together {
        amount_col: ColumnRef,
        direction_col: ColumnRef,
        debit_flag: String,
        credit_flag: String,
        credit_action: CreditAction,
    },
}

/// Immutable settings for one processing run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub voucher_col: ColumnRef,
    pub subject_col: ColumnRef,
    pub mode: ModeSettings,
    pub sheet_name: Option<String>,
    /// `None` appends after the last column.
    pub target_col: Option<ColumnRef>,
    /// `None` writes next to the input file.
    pub save_dir: Option<PathBuf>,
}

impl RunConfig {
    pub fn mode(&self) -> Mode {
        match self.mode {
            ModeSettings::Separate { .. } => Mode::Separate,
            ModeSettings::Together { .. } => Mode::Together,
        }
    }

    /// Required columns in a fixed order: voucher, subject, then the mode's two columns.
    pub fn column_refs(&self) -> Vec<(ColumnRole, ColumnRef)> {
        let mut refs = vec![
            (ColumnRole::Voucher, self.voucher_col.clone()),
            (ColumnRole::Subject, self.subject_col.clone()),
        ];
        match &self.mode {
            ModeSettings::Separate { debit_col, credit_col } => {
                refs.push((ColumnRole::DebitAmount, debit_col.clone()));
                refs.push((ColumnRole::CreditAmount, credit_col.clone()));
            }
            ModeSettings::Together { amount_col, direction_col, .. } => {
                refs.push((ColumnRole::Amount, amount_col.clone()));
                refs.push((ColumnRole::Direction, direction_col.clone()));
            }
        }
        refs
    }

    /// Build the engine's classification mode from the two mode columns resolved
    /// in [`RunConfig::column_refs`] order.
    pub fn classification(&self, first: ColumnId, second: ColumnId) -> ClassificationMode {
        match &self.mode {
            ModeSettings::Separate { .. } => ClassificationMode::SeparateAmounts { debit: first, credit: second },
            ModeSettings::Together { debit_flag, credit_flag, .. } => ClassificationMode::CombinedAmount {
                amount: first,
                direction: second,
                debit_flag: debit_flag.clone(),
                credit_flag: credit_flag.clone(),
            },
        }
    }
}

/// Partially specified configuration, as read from a JSON file or the command line.
/// Every field is optional until [`RawConfig::finish`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub mode: Option<Mode>,
    pub voucher_col: Option<String>,
    pub subject_col: Option<String>,
    pub debit_col: Option<String>,
    pub credit_col: Option<String>,
    pub amount_col: Option<String>,
    pub direction_col: Option<String>,
    pub debit_flag: Option<String>,
    pub credit_flag: Option<String>,
    pub credit_action: Option<CreditAction>,
    pub sheet_name: Option<String>,
    pub target_col: Option<String>,
    pub save_dir: Option<PathBuf>,
}

fn take(v: &Option<String>) -> Option<String> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

impl RawConfig {
    /// Values set in `other` win.
    pub fn overlay(mut self, other: RawConfig) -> Self {
        macro_rules! pick {
            ($($f:ident),*) => { $( if other.$f.is_some() { self.$f = other.$f; } )* };
        }
        pick!(
            mode, voucher_col, subject_col, debit_col, credit_col, amount_col, direction_col,
            debit_flag, credit_flag, credit_action, sheet_name, target_col, save_dir
        );
        self
    }

    /// Validate required fields for the selected mode (default `separate`).
    pub fn finish(self) -> Result<RunConfig, ConfigError> {
        let mode = self.mode.unwrap_or(Mode::Separate);
        let mut missing: Vec<&'static str> = Vec::new();
        let mut required = |name: &'static str, v: &Option<String>| {
            let t = take(v);
            if t.is_none() { missing.push(name); }
            t.unwrap_or_default()
        };

        let voucher = required("voucher_col", &self.voucher_col);
        let subject = required("subject_col", &self.subject_col);
        let mode_settings = match mode {
            Mode::Separate => {
                let debit = required("debit_col", &self.debit_col);
                let credit = required("credit_col", &self.credit_col);
                ModeSettings::Separate { debit_col: ColumnRef::parse(&debit), credit_col: ColumnRef::parse(&credit) }
            }
            Mode::Together => {
                let amount = required("amount_col", &self.amount_col);
                let direction = required("direction_col", &self.direction_col);
                let debit_flag = required("debit_flag", &self.debit_flag);
                let credit_flag = required("credit_flag", &self.credit_flag);
                ModeSettings::Together {
                    amount_col: ColumnRef::parse(&amount),
                    direction_col: ColumnRef::parse(&direction),
                    debit_flag,
                    credit_flag,
                    credit_action: self.credit_action.unwrap_or_default(),
                }
            }
        };
        if !missing.is_empty() {
            return Err(ConfigError::MissingFields(missing));
        }

        let target_col = match take(&self.target_col) {
            None => None,
            Some(t) => {
                let r = ColumnRef::parse(&t);
                if r.position().is_none_or(|p| p == 0) {
                    return Err(ConfigError::InvalidValue { field: "target_col", value: t });
                }
                Some(r)
            }
        };

        Ok(RunConfig {
            voucher_col: ColumnRef::parse(&voucher),
            subject_col: ColumnRef::parse(&subject),
            mode: mode_settings,
            sheet_name: take(&self.sheet_name),
            target_col,
            save_dir: self.save_dir,
        })
    }
}

pub fn load_config(path: &Path) -> Result<RawConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("读取配置失败: {}", path.display()))?;
    let cfg: RawConfig = serde_json::from_str(&text).context("配置 JSON 解析失败")?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn separate_raw() -> RawConfig {
        RawConfig {
            voucher_col: Some("B".into()),
            subject_col: Some(" 科目名称 ".into()),
            debit_col: Some("5".into()),
            credit_col: Some("F".into()),
            ..RawConfig::default()
        }
    }

    #[test]
    fn separate_is_the_default_mode() {
        let cfg = separate_raw().finish().unwrap();
        assert_eq!(cfg.mode(), Mode::Separate);
        assert_eq!(cfg.subject_col, ColumnRef::Name("科目名称".into()));
        assert_eq!(cfg.target_col, None);
        let roles: Vec<ColumnRole> = cfg.column_refs().into_iter().map(|(r, _)| r).collect();
        assert_eq!(
            roles,
            vec![ColumnRole::Voucher, ColumnRole::Subject, ColumnRole::DebitAmount, ColumnRole::CreditAmount]
        );
    }

    #[test]
    fn missing_fields_are_all_listed() {
        let raw = RawConfig {
            mode: Some(Mode::Together),
            voucher_col: Some("A".into()),
            subject_col: Some("   ".into()),
            amount_col: Some("C".into()),
            ..RawConfig::default()
        };
        let err = raw.finish().unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingFields(vec!["subject_col", "direction_col", "debit_flag", "credit_flag"])
        );
        assert!(err.to_string().contains("必填字段不能为空"));
    }

    #[test]
    fn invalid_target_column() {
        let mut raw = separate_raw();
        raw.target_col = Some("目标".into());
        assert!(matches!(raw.finish(), Err(ConfigError::InvalidValue { field: "target_col", .. })));
        let mut raw = separate_raw();
        raw.target_col = Some("0".into());
        assert!(raw.finish().is_err());
        let mut raw = separate_raw();
        raw.target_col = Some("ai".into());
        assert_eq!(raw.finish().unwrap().target_col, Some(ColumnRef::Letter("AI".into())));
    }

    #[test]
    fn json_with_cli_overlay() {
        let json = r#"{
            "mode": "together",
            "voucher_col": "凭证字号",
            "subject_col": "B",
            "amount_col": "C",
            "direction_col": "D",
            "debit_flag": "借",
            "credit_flag": "贷",
            "credit_action": "取相反数",
            "sheet_name": "序时账"
        }"#;
        let file: RawConfig = serde_json::from_str(json).unwrap();
        let cli = RawConfig { credit_flag: Some("贷方".into()), target_col: Some("H".into()), ..RawConfig::default() };
        let cfg = file.overlay(cli).finish().unwrap();
        assert_eq!(cfg.mode(), Mode::Together);
        assert_eq!(cfg.sheet_name.as_deref(), Some("序时账"));
        match &cfg.mode {
            ModeSettings::Together { debit_flag, credit_flag, credit_action, .. } => {
                assert_eq!(debit_flag, "借");
                assert_eq!(credit_flag, "贷方");
                assert_eq!(*credit_action, CreditAction::Negate);
            }
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn credit_action_parsing() {
        assert_eq!("直接等于".parse::<CreditAction>().unwrap(), CreditAction::AsIs);
        assert_eq!("negate".parse::<CreditAction>().unwrap(), CreditAction::Negate);
        assert!("翻倍".parse::<CreditAction>().is_err());
        let a: CreditAction = serde_json::from_str("\"as-is\"").unwrap();
        assert_eq!(a, CreditAction::AsIs);
        assert_eq!(CreditAction::Negate.to_string(), "取相反数");
    }
}
