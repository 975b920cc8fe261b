//! Confidant - 陪伴型聊天助手
//!
//! 入口：初始化日志、加载配置、创建 Agent 组件，并运行命令行交互循环。
//! Ctrl+C 只取消当前这一轮交换；输入 /quit 或 EOF 退出。
//! 用法：confidant [config.toml]；confidant --schema 输出持久化文件的 JSON Schema。

use std::io::Write;

use anyhow::Context;
use confidant::{
    agent::{
        create_agent_components, list_models, process_message_stream, reset_model_errors,
        switch_model, AgentComponents,
    },
    config::load_config,
    core::SessionSupervisor,
    memory::schema::schema_bundle_json,
    observability,
    reasoning::{ExchangeRequest, StreamEvent},
};
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "commands: /models, /model <name>, /reset, /user <id>, /help, /quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let arg = std::env::args().nth(1);
    if arg.as_deref() == Some("--schema") {
        println!("{}", schema_bundle_json().context("Failed to render schema")?);
        return Ok(());
    }
    let config_path = arg.map(std::path::PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let mut user_id = cfg.app.default_user.clone();

    let components = create_agent_components(cfg).context("Failed to create agent")?;
    let supervisor = SessionSupervisor::new();

    println!("confidant ready (user: {}). {}", user_id, HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{}> ", user_id);
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            let mut parts = command.splitn(2, ' ');
            match (parts.next().unwrap_or(""), parts.next().map(str::trim)) {
                ("quit" | "exit", _) => break,
                ("help", _) => println!("{}", HELP),
                ("models", _) => print_models(&components),
                ("model", Some(name)) if !name.is_empty() => {
                    let outcome = switch_model(&components, name);
                    match outcome.error {
                        None => println!("switched to {}", name),
                        Some(e) => println!("switch failed: {}", e),
                    }
                }
                ("reset", _) => {
                    reset_model_errors(&components);
                    println!("quota flags cleared");
                }
                ("user", Some(id)) if !id.is_empty() => {
                    user_id = id.to_string();
                    println!("now talking as {}", user_id);
                }
                _ => println!("unknown command. {}", HELP),
            }
            continue;
        }

        run_turn(&components, &supervisor, &user_id, line).await;
    }

    supervisor.shutdown();
    if let Err(e) = components.memory.flush_all().await {
        tracing::warn!(error = %e, "failed to flush memory on exit");
    }
    Ok(())
}

/// 运行一轮交换：分片到达即打印；交换期间 Ctrl+C 取消本轮
async fn run_turn(components: &AgentComponents, supervisor: &SessionSupervisor, user_id: &str, message: &str) {
    let token = supervisor.begin_exchange();
    let mut exchange = process_message_stream(
        components,
        ExchangeRequest::new(user_id, message),
        token,
    );

    loop {
        tokio::select! {
            event = exchange.next_event() => {
                let Some(event) = event else { break };
                match event {
                    StreamEvent::Chunk { content } => {
                        print!("{}", content);
                        std::io::stdout().flush().ok();
                    }
                    StreamEvent::ToolResult { name, .. } => println!("[tool {} ok]", name),
                    StreamEvent::ToolError { name, error } => println!("[tool {} failed: {}]", name, error),
                    StreamEvent::Error { message } => println!("\n[error] {}", message),
                    StreamEvent::FinalResponse { .. } => println!(),
                    StreamEvent::MessageComplete {} => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if supervisor.cancel_current() {
                    println!("\n[cancelled]");
                }
            }
        }
    }

    if let Err(e) = exchange.finish().await {
        tracing::debug!(error = %e, "exchange ended without a response");
    }
}

fn print_models(components: &AgentComponents) {
    for status in list_models(components) {
        let marker = if status.is_current { "*" } else { " " };
        let state = if status.candidate.error_flag {
            "quota exhausted"
        } else {
            "available"
        };
        println!(
            "{} {} ({}, {} tokens)",
            marker, status.candidate.name, state, status.total_tokens
        );
    }
}
