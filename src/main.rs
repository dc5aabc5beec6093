use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use counterparty_account::batch::{collect_inputs, run_batch, BatchEvent, CancelToken};
use counterparty_account::config::{self, CreditAction, Mode, RawConfig};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    /// 借贷方分开（借方金额列 + 贷方金额列）
    Separate,
    /// 借贷方在一起（金额列 + 借贷标识列）
    Together,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Separate => Mode::Separate,
            ModeArg::Together => Mode::Together,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "counterparty",
    version,
    about = "为序时账生成“对方科目”列",
    long_about = "\
按凭证字号对序时账分组，对每一行写出同一凭证中对方方向的科目名称（以“、”连接）：\n\
- 两种模式：借贷方分开（借方金额列/贷方金额列）与借贷方在一起（金额列/借贷标识列）；\n\
- 列可以用字母（A、AI）、从 1 开始的序号或表头名称指定；\n\
- 输入可以是单个文件或目录（批量处理 .xls/.xlsx/.xlsm/.csv）；\n\
- 结果保存为 <原文件名>_处理后<扩展名>，.xls 输入保存为 .xlsx，.xlsm 保留宏。"
)]
struct Args {
    /// 序时账文件或目录
    #[arg(long, value_name = "FILE|DIR")]
    input: PathBuf,

    /// JSON 配置文件（可选）；命令行参数优先于配置文件
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// 模式：separate（借贷方分开，默认）或 together（借贷方在一起）
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// 凭证字号列
    #[arg(long, value_name = "COL")]
    voucher_col: Option<String>,

    /// 科目名称列
    #[arg(long, value_name = "COL")]
    subject_col: Option<String>,

    /// 借方金额列（separate）
    #[arg(long, value_name = "COL")]
    debit_col: Option<String>,

    /// 贷方金额列（separate）
    #[arg(long, value_name = "COL")]
    credit_col: Option<String>,

    /// 借贷方金额列（together）
    #[arg(long, value_name = "COL")]
    amount_col: Option<String>,

    /// 借贷标识列（together）
    #[arg(long, value_name = "COL")]
    direction_col: Option<String>,

    /// 借方标识，如“借”（together）
    #[arg(long, value_name = "TEXT")]
    debit_flag: Option<String>,

    /// 贷方标识，如“贷”（together）
    #[arg(long, value_name = "TEXT")]
    credit_flag: Option<String>,

    /// 贷方处理方式：直接等于 / 取相反数（together）
    #[arg(long, value_name = "ACTION")]
    credit_action: Option<CreditAction>,

    /// 工作表名称；默认第一个工作表
    #[arg(long = "sheet", value_name = "NAME")]
    sheet_name: Option<String>,

    /// 目标列位置（字母或序号）；默认追加在最后一列之后
    #[arg(long, value_name = "COL")]
    target_col: Option<String>,

    /// 保存目录；默认与输入文件相同
    #[arg(long, value_name = "DIR")]
    save_dir: Option<PathBuf>,

    /// 输出详细日志（默认关闭）
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

impl Args {
    fn to_raw_config(&self) -> RawConfig {
        RawConfig {
            mode: self.mode.map(Mode::from),
            voucher_col: self.voucher_col.clone(),
            subject_col: self.subject_col.clone(),
            debit_col: self.debit_col.clone(),
            credit_col: self.credit_col.clone(),
            amount_col: self.amount_col.clone(),
            direction_col: self.direction_col.clone(),
            debit_flag: self.debit_flag.clone(),
            credit_flag: self.credit_flag.clone(),
            credit_action: self.credit_action,
            sheet_name: self.sheet_name.clone(),
            target_col: self.target_col.clone(),
            save_dir: self.save_dir.clone(),
        }
    }
}

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool { metadata.level() <= log::max_level() }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) { return; }
        match record.level() {
            Level::Error | Level::Warn => eprintln!("[{}] {}", record.level(), record.args()),
            _ => eprintln!("{}", record.args()),
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(verbose: bool) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(if verbose { LevelFilter::Debug } else { LevelFilter::Info });
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let raw = match &args.config {
        Some(p) => config::load_config(p).context("读取配置文件失败")?,
        None => RawConfig::default(),
    };
    let cfg = raw.overlay(args.to_raw_config()).finish()?;
    if let Some(dir) = &cfg.save_dir {
        if !dir.is_dir() { bail!("保存目录不存在: {}", dir.display()); }
    }
    log::debug!("运行配置: {cfg:?}");

    let files = collect_inputs(&args.input)?;
    if files.is_empty() {
        bail!("目录中没有可处理的 Excel/CSV 文件: {}", args.input.display());
    }

    let cancel = CancelToken::new();
    let summary = run_batch(&files, &cfg, &cancel, |event| match event {
        BatchEvent::Started { index, total, path } => {
            log::info!("[{index}/{total}] {}", path.display());
        }
        BatchEvent::Finished { index, total, ok, .. } => {
            log::debug!("[{index}/{total}] {}", if ok { "完成" } else { "失败" });
        }
    });

    for report in summary.outcomes.iter().flatten() {
        println!("{}", report.output.display());
    }
    if summary.failed() > 0 {
        bail!("{} 个文件处理失败（共 {} 个）", summary.failed(), files.len());
    }
    log::info!("处理完成！");
    Ok(())
}
