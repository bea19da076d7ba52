use anyhow::Result;
use clap::Parser;
use crossterm::{
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::fs::OpenOptions;
use std::io;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod app;
mod ui;

use apimap_chat::chat::ChatGateway;
use apimap_chat::client::AssistantClient;
use apimap_chat::config::{validate_greetings, Args, LoadingState};
use apimap_chat::graph::GraphClient;
use apimap_chat::reconciler::{ReadyStatus, ResourceReconciler};

use app::{App, GraphBackend};

fn setup_logging() -> Result<()> {
    // Create logs directory if it doesn't exist
    std::fs::create_dir_all("logs")?;

    // overwrite log file if it exists
    let log_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open("logs/apimap-chat.log")?;

    let file_layer = fmt::layer()
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(tracing_subscriber::filter::LevelFilter::DEBUG)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging()?;
    info!("apimap-chat starting up");

    let args = Args::parse();
    info!(
        "Service: {}, model: {}, graph: {}",
        args.service_url,
        args.model,
        args.graph_url.as_deref().unwrap_or("disabled")
    );

    // Fail fast if an assistant we can deploy has no greeting template.
    validate_greetings()?;

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let app = App::new(args.debug);
    let res = run_app(&mut terminal, app, args).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("{:?}", err);
    }

    Ok(())
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    mut app: App,
    args: Args,
) -> Result<()> {
    let client = AssistantClient::new(args.service_url.clone(), &args.api_key)?;
    let gateway = ChatGateway::new(client.clone());
    let reconciler = ResourceReconciler::new(client, args.model.clone());

    // Step 1: read the persisted config to pick the right progress wording
    app.begin_step(LoadingState::LoadingConfig);
    terminal.draw(|f| ui::render(f, &mut app, &args))?;

    let status = reconciler.status();
    if status.has_config() {
        info!("Found persisted resource config, will verify against the service");
    } else {
        info!("No persisted resources; first-time setup");
    }
    app.complete_step(LoadingState::LoadingConfig);

    // Step 2: vector store (verify-or-create, ingests the knowledge base)
    app.begin_step(LoadingState::EnsuringVectorStore);
    terminal.draw(|f| ui::render(f, &mut app, &args))?;

    let (vector_store_id, vs_status) = match reconciler.ensure_vector_store().await {
        Ok(result) => result,
        Err(e) => {
            error!("Vector store setup failed: {:?}", e);
            app.fail_step(LoadingState::EnsuringVectorStore, e.to_string());
            terminal.draw(|f| ui::render(f, &mut app, &args))?;
            return Err(e.into());
        }
    };
    app.complete_step(LoadingState::EnsuringVectorStore);

    // Step 3: assistant bound to that vector store
    app.begin_step(LoadingState::EnsuringAssistant);
    terminal.draw(|f| ui::render(f, &mut app, &args))?;

    let (assistant_id, asst_status) = match reconciler.ensure_assistant(&vector_store_id).await {
        Ok(result) => result,
        Err(e) => {
            error!("Assistant setup failed: {:?}", e);
            app.fail_step(LoadingState::EnsuringAssistant, e.to_string());
            terminal.draw(|f| ui::render(f, &mut app, &args))?;
            return Err(e.into());
        }
    };
    app.complete_step(LoadingState::EnsuringAssistant);

    match ReadyStatus::from_parts(vs_status, asst_status) {
        ReadyStatus::Retrieved => info!("Connected to existing assistant and knowledge base"),
        ReadyStatus::Created => info!("Provisioned a new assistant and knowledge base"),
        ReadyStatus::Mixed => info!("Refreshed part of the assistant setup"),
    }

    // Step 4: conversation thread on the selected backend
    app.begin_step(LoadingState::CreatingThread);
    terminal.draw(|f| ui::render(f, &mut app, &args))?;

    let (graph, thread_id) = match &args.graph_url {
        Some(url) => {
            let graph_client = GraphClient::new(url.clone(), args.graph_api_key.as_deref())?;
            let thread_id = match resolve_graph_thread(&graph_client, &args).await {
                Ok(id) => id,
                Err(e) => {
                    error!("Graph thread setup failed: {:?}", e);
                    app.fail_step(LoadingState::CreatingThread, e.to_string());
                    terminal.draw(|f| ui::render(f, &mut app, &args))?;
                    return Err(e);
                }
            };
            (
                Some(GraphBackend {
                    client: graph_client,
                    assistant: args.graph_assistant.clone(),
                }),
                thread_id,
            )
        }
        None => match gateway.create_thread().await {
            Ok(id) => (None, id),
            Err(e) => {
                error!("Thread creation failed: {:?}", e);
                app.fail_step(LoadingState::CreatingThread, e.to_string());
                terminal.draw(|f| ui::render(f, &mut app, &args))?;
                return Err(e);
            }
        },
    };
    app.complete_step(LoadingState::CreatingThread);

    app.session.vector_store_id = Some(vector_store_id);
    app.session.assistant_id = Some(assistant_id);
    app.session.thread_id = Some(thread_id);
    app.session.assistant_ready = true;
    app.finish_loading();
    info!("Application ready");

    let result = app
        .run(terminal, &gateway, &reconciler, graph.as_ref(), &args)
        .await;

    match &result {
        Ok(_) => info!("Application loop completed successfully"),
        Err(e) => error!("Application loop failed: {:?}", e),
    }

    result
}

/// Reuse the newest graph thread scoped to this user, or create one.
async fn resolve_graph_thread(client: &GraphClient, args: &Args) -> Result<String> {
    let threads = client.search_threads(&args.user).await?;
    if let Some(thread) = threads.into_iter().next() {
        info!("Reusing graph thread {}", thread.thread_id);
        return Ok(thread.thread_id);
    }

    let thread = client
        .create_thread(&args.user, Some(&args.graph_assistant))
        .await?;
    info!("Created graph thread {}", thread.thread_id);
    Ok(thread.thread_id)
}
