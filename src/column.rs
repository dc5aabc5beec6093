//! Column references: spreadsheet letters, 1-based numbers or header names.

use crate::journal::LedgerTable;
use std::fmt;

/// Position of a column within a [`LedgerTable`], 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnId(pub usize);

/// Logical purpose a column plays in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnRole {
    Voucher,
    Subject,
    DebitAmount,
    CreditAmount,
    Amount,
    Direction,
}

impl ColumnRole {
    pub fn label(self) -> &'static str {
        match self {
            ColumnRole::Voucher => "凭证字号列",
            ColumnRole::Subject => "科目名称列",
            ColumnRole::DebitAmount => "借方金额列",
            ColumnRole::CreditAmount => "贷方金额列",
            ColumnRole::Amount => "借贷方金额列",
            ColumnRole::Direction => "借贷标识列",
        }
    }
}

/// A user-supplied column reference, parsed once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    /// `A`, `AI`, ... (ASCII letters, case-insensitive)
    Letter(String),
    /// 1-based position
    Index(usize),
    /// Literal header text
    Name(String),
}

impl ColumnRef {
    pub fn parse(input: &str) -> Self {
        let s = input.trim();
        if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphabetic()) {
            ColumnRef::Letter(s.to_ascii_uppercase())
        } else if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
            // Digit strings too long for usize can never be in range.
            ColumnRef::Index(s.parse().unwrap_or(usize::MAX))
        } else {
            ColumnRef::Name(s.to_string())
        }
    }

    /// 1-based position for letter/number forms.
    pub fn position(&self) -> Option<usize> {
        match self {
            ColumnRef::Letter(l) => excel_column_to_num(l),
            ColumnRef::Index(i) => Some(*i),
            ColumnRef::Name(_) => None,
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnRef::Letter(l) => f.write_str(l),
            ColumnRef::Index(i) => write!(f, "{i}"),
            ColumnRef::Name(n) => f.write_str(n),
        }
    }
}

/// Excel column letters to a 1-based index (`A` -> 1, `AA` -> 27, `AI` -> 35).
/// `None` for empty input, non-letters or overflow.
pub fn excel_column_to_num(col: &str) -> Option<usize> {
    if col.is_empty() { return None; }
    col.chars().try_fold(0usize, |acc, c| {
        if !c.is_ascii_alphabetic() { return None; }
        let digit = (c.to_ascii_uppercase() as u8 - b'A' + 1) as usize;
        acc.checked_mul(26)?.checked_add(digit)
    })
}

/// Inverse of [`excel_column_to_num`]; `0` has no letter form.
pub fn num_to_excel_column(mut n: usize) -> Option<String> {
    if n == 0 { return None; }
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingColumn {
    pub role: ColumnRole,
    pub reference: String,
}

impl fmt::Display for MissingColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}（{}）", self.reference, self.role.label())
    }
}

/// One or more required columns could not be found; lists every one of them.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("以下列不存在于文件中：{}", join_missing(.missing))]
pub struct ColumnResolutionError {
    pub missing: Vec<MissingColumn>,
}

fn join_missing(missing: &[MissingColumn]) -> String {
    missing.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Map a reference to a concrete column of `table`.
pub fn resolve(table: &LedgerTable, column_ref: &ColumnRef) -> Option<ColumnId> {
    match column_ref {
        ColumnRef::Name(name) => table.headers.iter().position(|h| h == name).map(ColumnId),
        other => {
            let pos = other.position()?;
            (1..=table.width()).contains(&pos).then(|| ColumnId(pos - 1))
        }
    }
}

/// Resolve every required role at once, reporting all failures together.
pub fn resolve_all(
    table: &LedgerTable,
    refs: &[(ColumnRole, ColumnRef)],
) -> Result<Vec<ColumnId>, ColumnResolutionError> {
    let mut ids = Vec::with_capacity(refs.len());
    let mut missing = Vec::new();
    for (role, r) in refs {
        match resolve(table, r) {
            Some(id) => ids.push(id),
            None => missing.push(MissingColumn { role: *role, reference: r.to_string() }),
        }
    }
    if missing.is_empty() { Ok(ids) } else { Err(ColumnResolutionError { missing }) }
}
