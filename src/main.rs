use std::io::Write;
use std::path::PathBuf;

use pipeline_gate::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "Unknown location".to_string());

        eprintln!("[PANIC] 程序异常退出");
        eprintln!("位置: {}", location);
        eprintln!("原因: {}", message);
        eprintln!(
            "时间: {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        );

        tracing::error!(event = "panic.raised", location = %location, reason = %message);

        let panic_msg = format!(
            "PANIC OCCURRED\nLocation: {}\nReason: {}\nTime: {}\n\n",
            location,
            message,
            chrono::Utc::now()
        );

        if let Err(e) = std::fs::write("./panic.log", &panic_msg) {
            eprintln!("[WARN] 无法写入panic.log: {}", e);
        }

        if let Ok(()) = std::fs::create_dir_all("./runtime/logs") {
            let panic_file = format!(
                "./runtime/logs/panic-{}.log",
                chrono::Utc::now().format("%Y%m%d-%H%M%S")
            );
            if let Err(e) = std::fs::write(&panic_file, &panic_msg) {
                eprintln!("[WARN] 无法写入运行时panic日志: {}", e);
            } else {
                eprintln!("[OK] Panic信息已保存到 {}", panic_file);
            }
        }

        std::io::stderr().flush().ok();
    }));

    let mut command = None;
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => anyhow::bail!("--config 需要指定文件路径"),
            },
            other if command.is_none() => command = Some(other.to_string()),
            other => anyhow::bail!("无法识别的参数: {}", other),
        }
    }

    match command.as_deref() {
        Some("check-config") | Some("--check-config") => {
            let report = server::check_config(config_path.as_deref())?;
            println!(
                "配置检查: errors={}, warnings={}, info={}",
                report.errors.len(),
                report.warnings.len(),
                report.info.len()
            );
            for issue in report.errors.iter() {
                println!("  [error] {}", issue);
            }
            for issue in report.warnings.iter() {
                println!("  [warn] {}", issue);
            }
            for issue in report.info.iter() {
                println!("  [info] {}", issue);
            }
            if report.has_errors() {
                std::process::exit(1);
            }
            Ok(())
        }
        Some("print-template") | Some("--print-template") => {
            print!("{}", server::template()?);
            Ok(())
        }
        Some("run") | None => {
            server::start_pipeline(config_path.as_deref()).await?;
            // 标准输入的阻塞读取无法取消，运行时退出时会一直等待它
            std::io::stdout().flush().ok();
            std::process::exit(0);
        }
        Some(other) => anyhow::bail!(
            "未知命令: {}（可用: run, check-config, print-template）",
            other
        ),
    }
}
