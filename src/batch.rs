//! File-level pipeline: read, resolve columns, compute counterparties, write.

use crate::column::{num_to_excel_column, resolve_all, ColumnResolutionError};
use crate::config::RunConfig;
use crate::journal::load_ledger;
use crate::output::{output_path, write_output, OUTPUT_SUFFIX};
use crate::{resolve_counterparties, Conventions, RoleBindings};
use anyhow::{anyhow, Context};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

const INPUT_EXTENSIONS: &[&str] = &["xls", "xlsx", "xlsm", "csv"];

/// Cooperative stop flag, checked between files only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self { Self::default() }

    pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst); }

    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::SeqCst) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub rows: usize,
    /// Rows that received a non-empty counterparty.
    pub resolved: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum FileError {
    #[error("处理文件失败：{}\n{source}", .path.display())]
    MissingColumns {
        path: PathBuf,
        #[source]
        source: ColumnResolutionError,
    },
    #[error("处理文件失败：{}\n{source:#}", .path.display())]
    Failed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl FileError {
    pub fn path(&self) -> &Path {
        match self {
            FileError::MissingColumns { path, .. } | FileError::Failed { path, .. } => path,
        }
    }
}

/// A single file yields itself; a directory yields its ledger files sorted by
/// name, leaving out outputs of earlier runs.
pub fn collect_inputs(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !path.is_dir() {
        if !path.exists() {
            return Err(anyhow!("路径不存在: {}", path.display()));
        }
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(path).with_context(|| format!("读取目录失败: {}", path.display()))? {
        let p = entry?.path();
        if !p.is_file() { continue; }
        let ext_ok = p
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| INPUT_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)));
        let derived = p
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.ends_with(OUTPUT_SUFFIX));
        // Office lock files (~$book.xlsx)
        let lock = p
            .file_name()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.starts_with("~$"));
        if ext_ok && !derived && !lock {
            files.push(p);
        }
    }
    files.sort();
    Ok(files)
}

/// Run the whole pipeline for one file. Nothing is written unless every
/// required column resolves.
pub fn process_file(path: &Path, cfg: &RunConfig) -> Result<FileReport, FileError> {
    let failed = |source: anyhow::Error| FileError::Failed { path: path.to_path_buf(), source };

    let table = load_ledger(path, cfg.sheet_name.as_deref())
        .with_context(|| format!("读取序时账失败: {}", path.display()))
        .map_err(failed)?;

    let ids = resolve_all(&table, &cfg.column_refs())
        .map_err(|source| FileError::MissingColumns { path: path.to_path_buf(), source })?;
    let [voucher, subject, first, second] = ids[..] else {
        return Err(failed(anyhow!("列解析结果数量异常: {}", ids.len())));
    };
    let roles = RoleBindings { voucher, subject };
    let mode = cfg.classification(first, second);

    let target = match &cfg.target_col {
        Some(r) => r
            .position()
            .filter(|p| *p > 0)
            .map(|p| p - 1)
            .ok_or_else(|| failed(anyhow!("目标列无效: {r}")))?,
        None => table.width(),
    };

    let results = resolve_counterparties(&table, &roles, &mode, &Conventions::default());
    let resolved = results.iter().filter(|s| !s.is_empty()).count();

    let output = output_path(path, cfg.save_dir.as_deref()).map_err(failed)?;
    write_output(path, &output, cfg.sheet_name.as_deref(), &table, target, &results).map_err(failed)?;
    log::debug!(
        "{}: {} 行, {} 行得到对方科目, 写入 {} 列",
        path.display(),
        table.len(),
        resolved,
        num_to_excel_column(target + 1).unwrap_or_default()
    );

    Ok(FileReport { input: path.to_path_buf(), output, rows: table.len(), resolved })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent<'a> {
    /// About to process file `index` of `total` (1-based).
    Started { index: usize, total: usize, path: &'a Path },
    Finished { index: usize, total: usize, path: &'a Path, ok: bool },
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub outcomes: Vec<Result<FileReport, FileError>>,
    pub cancelled: bool,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize { self.outcomes.iter().filter(|o| o.is_ok()).count() }

    pub fn failed(&self) -> usize { self.outcomes.len() - self.succeeded() }
}

/// Process `files` one after another. A failing file never stops the batch;
/// cancellation takes effect before the next file starts.
pub fn run_batch<F>(files: &[PathBuf], cfg: &RunConfig, cancel: &CancelToken, mut on_event: F) -> BatchSummary
where
    F: FnMut(BatchEvent<'_>),
{
    let total = files.len();
    let mut summary = BatchSummary::default();
    for (i, path) in files.iter().enumerate() {
        if cancel.is_cancelled() {
            log::info!("处理已中止，剩余 {} 个文件未处理", total - i);
            summary.cancelled = true;
            break;
        }
        let index = i + 1;
        on_event(BatchEvent::Started { index, total, path });
        let outcome = process_file(path, cfg);
        if let Err(e) = &outcome {
            log::warn!("{e}");
        }
        on_event(BatchEvent::Finished { index, total, path, ok: outcome.is_ok() });
        summary.outcomes.push(outcome);
    }
    summary
}
