//! Counterparty account (对方科目) resolution for ledger spreadsheets.
//!
//! Lines are grouped by voucher number, classified as debit or credit, and
//! every line receives the subjects found on the opposite side of its own
//! voucher, joined with `、`.

pub mod batch;
pub mod column;
pub mod config;
pub mod journal;
pub mod output;
pub mod package;

use column::ColumnId;
use journal::LedgerTable;
use std::collections::{HashMap, HashSet};

/// Separator between subject names in a result cell.
pub const SUBJECT_SEPARATOR: &str = "、";

/// Columns every run needs regardless of classification mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleBindings {
    pub voucher: ColumnId,
    pub subject: ColumnId,
}

/// How a line is recognised as debit or credit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassificationMode {
    /// Two numeric columns; debit wins when both are positive.
    SeparateAmounts { debit: ColumnId, credit: ColumnId },
    /// One amount column plus a direction flag compared by exact string equality.
    ///
    /// Rows whose amount is zero, blank or unparseable are left unclassified
    /// whatever their flag says, so they neither contribute subjects nor
    /// receive any. Negative amounts still count.
    CombinedAmount {
        amount: ColumnId,
        direction: ColumnId,
        debit_flag: String,
        credit_flag: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conventions {
    pub separator: String,
}

impl Default for Conventions {
    fn default() -> Self {
        Self { separator: SUBJECT_SEPARATOR.to_string() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Debit,
    Credit,
}

/// Voucher identifier as text, without a trailing `.0` and surrounding whitespace.
pub fn normalize_voucher(raw: &str) -> String {
    raw.strip_suffix(".0").unwrap_or(raw).trim().to_string()
}

/// Side of row `row` under `mode`, if any.
pub fn classify(table: &LedgerTable, row: usize, mode: &ClassificationMode) -> Option<Side> {
    match mode {
        ClassificationMode::SeparateAmounts { debit, credit } => {
            if table.cell(row, debit.0).to_amount() > 0.0 {
                Some(Side::Debit)
            } else if table.cell(row, credit.0).to_amount() > 0.0 {
                Some(Side::Credit)
            } else {
                None
            }
        }
        ClassificationMode::CombinedAmount { amount, direction, debit_flag, credit_flag } => {
            // Zero or unparseable amounts take no part, whatever the flag says.
            if table.cell(row, amount.0).to_amount() == 0.0 {
                return None;
            }
            let flag = table.cell(row, direction.0).to_text();
            if flag == *debit_flag {
                Some(Side::Debit)
            } else if flag == *credit_flag {
                Some(Side::Credit)
            } else {
                None
            }
        }
    }
}

/// De-duplicated subject names in first-seen order.
#[derive(Debug, Default)]
struct SubjectSet {
    names: Vec<String>,
    seen: HashSet<String>,
}

impl SubjectSet {
    fn insert(&mut self, name: String) {
        if self.seen.insert(name.clone()) {
            self.names.push(name);
        }
    }

    fn join(&self, sep: &str) -> String { self.names.join(sep) }
}

/// Compute the counterparty subjects for every row of `table`.
///
/// The result has one entry per row, in row order. Rows that are neither
/// debit nor credit get an empty string. Within a cell, names appear in the
/// order they were first seen in the voucher.
pub fn resolve_counterparties(
    table: &LedgerTable,
    roles: &RoleBindings,
    mode: &ClassificationMode,
    conventions: &Conventions,
) -> Vec<String> {
    let mut results = vec![String::new(); table.len()];

    // voucher -> row indices, kept in first-seen voucher order
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for row in 0..table.len() {
        let voucher = normalize_voucher(&table.cell(row, roles.voucher.0).to_text());
        groups
            .entry(voucher)
            .or_insert_with_key(|k| {
                order.push(k.clone());
                Vec::new()
            })
            .push(row);
    }

    let mut sides: Vec<Option<Side>> = Vec::with_capacity(table.len());
    for row in 0..table.len() {
        sides.push(classify(table, row, mode));
    }

    for voucher in &order {
        let rows = &groups[voucher];
        let mut debit_subjects = SubjectSet::default();
        let mut credit_subjects = SubjectSet::default();
        for &row in rows {
            let subject = table.cell(row, roles.subject.0);
            if subject.is_empty() { continue; }
            match sides[row] {
                Some(Side::Debit) => debit_subjects.insert(subject.to_text()),
                Some(Side::Credit) => credit_subjects.insert(subject.to_text()),
                None => {}
            }
        }

        let debit_str = debit_subjects.join(&conventions.separator);
        let credit_str = credit_subjects.join(&conventions.separator);
        for &row in rows {
            results[row] = match sides[row] {
                Some(Side::Debit) => credit_str.clone(),
                Some(Side::Credit) => debit_str.clone(),
                None => String::new(),
            };
        }
        log::trace!("凭证 {voucher}: {} 行, 借方[{debit_str}] 贷方[{credit_str}]", rows.len());
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Cell;
    use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
    use std::collections::BTreeSet;

    const V: ColumnId = ColumnId(0);
    const S: ColumnId = ColumnId(1);
    const A: ColumnId = ColumnId(2);
    const B: ColumnId = ColumnId(3);

    fn roles() -> RoleBindings { RoleBindings { voucher: V, subject: S } }

    fn separate() -> ClassificationMode { ClassificationMode::SeparateAmounts { debit: A, credit: B } }

    fn together() -> ClassificationMode {
        ClassificationMode::CombinedAmount {
            amount: A,
            direction: B,
            debit_flag: "借".into(),
            credit_flag: "贷".into(),
        }
    }

    fn sep_table(rows: &[(&str, &str, f64, f64)]) -> LedgerTable {
        LedgerTable::new(
            vec!["凭证号".into(), "科目".into(), "借方".into(), "贷方".into()],
            rows.iter()
                .map(|(v, s, d, c)| vec![Cell::from(*v), Cell::from(*s), Cell::from(*d), Cell::from(*c)])
                .collect(),
        )
    }

    fn run(t: &LedgerTable, mode: &ClassificationMode) -> Vec<String> {
        resolve_counterparties(t, &roles(), mode, &Conventions::default())
    }

    fn as_set(s: &str) -> BTreeSet<&str> {
        s.split(SUBJECT_SEPARATOR).filter(|x| !x.is_empty()).collect()
    }

    #[test]
    fn voucher_normalization() {
        assert_eq!(normalize_voucher("1001.0"), "1001");
        assert_eq!(normalize_voucher("  1001  "), "1001");
        assert_eq!(normalize_voucher(&Cell::Number(1001.0).to_text()), "1001");
        assert_eq!(normalize_voucher("记-12"), "记-12");
        assert_eq!(normalize_voucher("10.05"), "10.05");
    }

    #[test]
    fn separate_mode_scenario() {
        let t = sep_table(&[
            ("V1", "银行存款", 100.0, 0.0),
            ("V1", "应收账款", 0.0, 100.0),
            ("V1", "管理费用", 50.0, 0.0),
        ]);
        let out = run(&t, &separate());
        assert_eq!(out[0], "应收账款");
        assert_eq!(out[2], "应收账款");
        assert_eq!(as_set(&out[1]), BTreeSet::from(["银行存款", "管理费用"]));
        // first-seen order
        assert_eq!(out[1], "银行存款、管理费用");
    }

    #[test]
    fn together_mode_scenario() {
        let t = LedgerTable::new(
            vec!["凭证号".into(), "科目".into(), "金额".into(), "方向".into()],
            vec![
                vec![Cell::from("V2"), Cell::from("库存现金"), Cell::from(100.0), Cell::from("借")],
                vec![Cell::from("V2"), Cell::from("主营收入"), Cell::from(100.0), Cell::from("贷")],
            ],
        );
        assert_eq!(run(&t, &together()), vec!["主营收入", "库存现金"]);
    }

    #[test]
    fn together_mode_flags_are_exact() {
        let t = LedgerTable::new(
            vec!["凭证号".into(), "科目".into(), "金额".into(), "方向".into()],
            vec![
                vec![Cell::from("1"), Cell::from("库存现金"), Cell::from(10.0), Cell::from("借 ")],
                vec![Cell::from("1"), Cell::from("银行存款"), Cell::from(10.0), Cell::from("借")],
                vec![Cell::from("1"), Cell::from("应付账款"), Cell::from(10.0), Cell::from("贷")],
                vec![Cell::from("1"), Cell::from("其他"), Cell::Empty, Cell::from("贷")],
            ],
        );
        let out = run(&t, &together());
        assert_eq!(out, vec!["", "应付账款", "银行存款", ""]);
    }

    #[test]
    fn together_mode_ignores_flagged_rows_without_amount() {
        let t = LedgerTable::new(
            vec!["凭证号".into(), "科目".into(), "金额".into(), "方向".into()],
            vec![
                vec![Cell::from("2"), Cell::from("银行存款"), Cell::from(50.0), Cell::from("借")],
                vec![Cell::from("2"), Cell::from("财务费用"), Cell::from(0.0), Cell::from("借")],
                vec![Cell::from("2"), Cell::from("其他应付款"), Cell::from("n/a"), Cell::from("贷")],
                vec![Cell::from("2"), Cell::from("实收资本"), Cell::from(-50.0), Cell::from("贷")],
            ],
        );
        let out = run(&t, &together());
        assert_eq!(out, vec!["实收资本", "", "", "银行存款"]);
    }

    #[test]
    fn vouchers_group_across_number_and_text_forms() {
        let t = LedgerTable::new(
            vec!["凭证号".into(), "科目".into(), "借方".into(), "贷方".into()],
            vec![
                vec![Cell::Number(1001.0), Cell::from("银行存款"), Cell::from(10.0), Cell::Empty],
                vec![Cell::from(" 1001.0"), Cell::from("短期借款"), Cell::Empty, Cell::from(10.0)],
            ],
        );
        assert_eq!(run(&t, &separate()), vec!["短期借款", "银行存款"]);
    }

    #[test]
    fn vouchers_do_not_leak_into_each_other() {
        let t = sep_table(&[
            ("1", "银行存款", 100.0, 0.0),
            ("2", "应付账款", 0.0, 100.0),
            ("1", "实收资本", 0.0, 100.0),
            ("2", "原材料", 100.0, 0.0),
        ]);
        assert_eq!(run(&t, &separate()), vec!["实收资本", "原材料", "银行存款", "应付账款"]);
    }

    #[test]
    fn duplicates_collapse() {
        let t = sep_table(&[
            ("9", "应付职工薪酬", 0.0, 30.0),
            ("9", "应付职工薪酬", 0.0, 20.0),
            ("9", "管理费用", 50.0, 0.0),
        ]);
        let out = run(&t, &separate());
        assert_eq!(out[2], "应付职工薪酬");
        assert_eq!(out[0], "管理费用");
    }

    #[test]
    fn zero_and_unparseable_amounts_are_excluded() {
        let t = LedgerTable::new(
            vec!["凭证号".into(), "科目".into(), "借方".into(), "贷方".into()],
            vec![
                vec![Cell::from("3"), Cell::from("银行存款"), Cell::from(10.0), Cell::Empty],
                vec![Cell::from("3"), Cell::from("财务费用"), Cell::from("abc"), Cell::from(0.0)],
                vec![Cell::from("3"), Cell::from("应收账款"), Cell::Empty, Cell::from("10")],
            ],
        );
        let out = run(&t, &separate());
        assert_eq!(out, vec!["应收账款", "", "银行存款"]);
    }

    #[test]
    fn one_sided_voucher_yields_empty_results() {
        let t = sep_table(&[("5", "银行存款", 10.0, 0.0), ("5", "库存现金", 5.0, 0.0), ("6", "预付账款", 0.0, 3.0)]);
        assert_eq!(run(&t, &separate()), vec!["", "", ""]);
    }

    #[test]
    fn both_positive_counts_as_debit() {
        let t = sep_table(&[("7", "银行存款", 10.0, 10.0), ("7", "应收账款", 0.0, 10.0)]);
        assert_eq!(run(&t, &separate()), vec!["应收账款", "银行存款"]);
    }

    #[test]
    fn own_subject_appears_only_via_opposite_rows() {
        let t = sep_table(&[
            ("8", "银行存款", 100.0, 0.0),
            ("8", "银行存款", 0.0, 40.0),
            ("8", "主营业务收入", 0.0, 60.0),
        ]);
        let out = run(&t, &separate());
        assert_eq!(as_set(&out[0]), BTreeSet::from(["银行存款", "主营业务收入"]));
        assert_eq!(out[1], "银行存款");

        let t = sep_table(&[("8", "银行存款", 100.0, 0.0), ("8", "主营业务收入", 0.0, 100.0)]);
        assert!(!run(&t, &separate())[0].contains("银行存款"));
    }

    #[test]
    fn empty_subjects_are_skipped() {
        let t = sep_table(&[("4", "", 10.0, 0.0), ("4", "应付账款", 0.0, 10.0), ("4", "银行存款", 5.0, 0.0)]);
        let out = run(&t, &separate());
        assert_eq!(out[1], "银行存款");
        assert_eq!(out[0], "应付账款");
    }

    #[test]
    fn custom_separator() {
        let t = sep_table(&[("1", "甲", 1.0, 0.0), ("1", "乙", 0.0, 1.0), ("1", "丙", 0.0, 1.0)]);
        let out = resolve_counterparties(&t, &roles(), &separate(), &Conventions { separator: "/".into() });
        assert_eq!(out[0], "乙/丙");
    }

    #[test]
    fn output_matches_input_length() {
        let empty = sep_table(&[]);
        assert!(run(&empty, &separate()).is_empty());
        let t = sep_table(&[("", "", 0.0, 0.0), ("1", "甲", 1.0, 0.0)]);
        assert_eq!(run(&t, &separate()).len(), 2);
    }

    #[test]
    fn rerun_is_identical() {
        let t = sep_table(&[
            ("1", "银行存款", 100.0, 0.0),
            ("1", "应收账款", 0.0, 60.0),
            ("1", "其他应收款", 0.0, 40.0),
            ("2", "管理费用", 10.0, 0.0),
            ("2", "库存现金", 0.0, 10.0),
        ]);
        assert_eq!(run(&t, &separate()), run(&t.clone(), &separate()));
    }

    #[test]
    fn shuffling_within_voucher_keeps_subject_sets() {
        let rows = [
            ("1", "银行存款", 100.0, 0.0),
            ("1", "应收账款", 0.0, 60.0),
            ("1", "其他应收款", 0.0, 40.0),
            ("1", "财务费用", 3.0, 0.0),
            ("1", "应收账款", 0.0, 3.0),
        ];
        let base = run(&sep_table(&rows), &separate());
        let expected: HashMap<&str, BTreeSet<&str>> =
            rows.iter().zip(&base).map(|(r, out)| (r.1, as_set(out))).collect();

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let mut shuffled = rows.to_vec();
            shuffled.shuffle(&mut rng);
            let out = run(&sep_table(&shuffled), &separate());
            for (r, got) in shuffled.iter().zip(&out) {
                assert_eq!(as_set(got), expected[r.1], "subject {}", r.1);
            }
        }
    }
}
