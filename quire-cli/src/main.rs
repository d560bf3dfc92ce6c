use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use directories::ProjectDirs;
use parking_lot::Mutex;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

use quire_core::{
    Locations, Locator, NavError, Publication, RectPayload, ResourceHost, ResourceSession,
    SelectionInfo, StepDirection,
};
use quire_highlight::HighlightManager;
use quire_nav::Navigator;
use quire_wire::{ScriptedRenderer, WireBridge};

#[derive(Debug, Parser)]
#[command(
    name = "quire",
    version,
    about = "reading-position and highlight engine demo against a scripted renderer"
)]
struct Args {
    /// Publication manifest (JSON: identifier, readingOrder, readingProgression)
    manifest: PathBuf,

    /// Sub-positions each resource paginates into
    #[arg(long, default_value_t = 4)]
    pages: usize,

    /// Device pixel density applied to highlight rectangles
    #[arg(long, default_value_t = 2.0)]
    density: f64,

    /// Resource href to open first (defaults to the first in reading order)
    #[arg(long)]
    href: Option<String>,
}

/// Fixed-pagination stand-in for a rendering surface: every resource splits
/// into `pages` sub-positions and scroll/step just move a cursor.
struct DemoSession {
    pages: usize,
    page: Mutex<usize>,
}

#[async_trait]
impl ResourceSession for DemoSession {
    async fn scroll_to(&self, locations: &Locations) -> quire_core::Result<()> {
        let progression = locations.progression.unwrap_or(0.0);
        let last = self.pages.saturating_sub(1);
        *self.page.lock() = ((progression * last as f64).round() as usize).min(last);
        Ok(())
    }

    async fn step(&self, direction: StepDirection) -> quire_core::Result<Option<f64>> {
        let mut page = self.page.lock();
        let last = self.pages.saturating_sub(1);
        match direction {
            StepDirection::Forward if *page < last => *page += 1,
            StepDirection::Backward if *page > 0 => *page -= 1,
            _ => return Ok(None),
        }
        Ok(Some(*page as f64 / last.max(1) as f64))
    }
}

struct DemoHost {
    pages: usize,
    renderer: Arc<ScriptedRenderer>,
}

#[async_trait]
impl ResourceHost for DemoHost {
    async fn load(&self, index: usize) -> quire_core::Result<Arc<dyn ResourceSession>> {
        info!(index, "loading resource");
        self.renderer.set_loaded(true);
        Ok(Arc::new(DemoSession {
            pages: self.pages.max(1),
            page: Mutex::new(0),
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let project_dirs = ProjectDirs::from("net", "quire", "quire")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let manifest = fs::read_to_string(&args.manifest)
        .with_context(|| format!("failed to read manifest {:?}", args.manifest))?;
    let publication: Arc<Publication> = Arc::new(
        serde_json::from_str(&manifest)
            .with_context(|| format!("failed to parse manifest {:?}", args.manifest))?,
    );
    if publication.reading_order.is_empty() {
        return Err(anyhow!("manifest has an empty reading order"));
    }

    let renderer = Arc::new(ScriptedRenderer::new());
    let (bridge, inbound) = WireBridge::new(16);
    tokio::spawn(Arc::clone(&renderer).serve(inbound, Arc::clone(&bridge)));

    let host = Arc::new(DemoHost {
        pages: args.pages,
        renderer: Arc::clone(&renderer),
    });
    let navigator = Arc::new(Navigator::new(Arc::clone(&publication), host));
    let manager = HighlightManager::new(
        bridge,
        Arc::clone(&publication),
        navigator.position_handle(),
        args.density,
    );

    let watcher = spawn_position_printer(&navigator);

    let first = match &args.href {
        Some(href) => publication
            .reading_order
            .iter()
            .find(|link| &link.href == href)
            .ok_or_else(|| anyhow!("href {href:?} is not in the reading order"))?
            .clone(),
        None => publication.reading_order[0].clone(),
    };
    navigator.go_to(Locator::from_link(&first)).await?;

    println!("opened {} ({} resources)", publication.identifier, publication.resource_count());

    while navigator.go_forward().await? {
        if navigator.current_index() != Some(0) {
            break;
        }
    }

    renderer.set_selection(Some(SelectionInfo {
        locations: Some(Locations::at_progression(0.5)),
        text: None,
    }));
    renderer.set_rect(Some(RectPayload {
        left: 10.0,
        top: 5.0,
        width: 20.0,
        height: 5.0,
    }));

    let highlight = manager.create_annotation(None).await?;
    println!(
        "annotated {} at {} (colour {},{},{})",
        highlight.id,
        highlight.locator.href,
        highlight.color.red,
        highlight.color.green,
        highlight.color.blue
    );

    match manager.rect_for(&highlight.id).await? {
        Some(rect) => println!(
            "highlight rect: left {} top {} right {} bottom {}",
            rect.left, rect.top, rect.right, rect.bottom
        ),
        None => println!("highlight is off-screen"),
    }

    manager.hide(&highlight.id).await;
    println!("hidden again; {} local records remain", manager.len());

    // Walk to the very end to show the outer-edge refusal.
    let last = publication.reading_order.last().unwrap().clone();
    navigator
        .go_to(Locator::from_link(&last).with_locations(Locations::end_of_resource()))
        .await?;
    match navigator.go_forward().await {
        Ok(false) => println!("at the publication edge; forward refused"),
        Ok(true) => println!("stepped past the expected edge"),
        Err(NavError::UnresolvableLocator { href }) => {
            println!("unexpected unresolvable href {href}")
        }
        Err(err) => return Err(err.into()),
    }

    println!("renderer journal:");
    for entry in renderer.journal() {
        println!("  {entry}");
    }

    watcher.abort();
    Ok(())
}

fn spawn_position_printer(navigator: &Arc<Navigator>) -> tokio::task::JoinHandle<()> {
    let mut stream = navigator.locator_stream();
    tokio::spawn(async move {
        while stream.changed().await.is_ok() {
            let Some(locator) = stream.borrow_and_update().clone() else {
                continue;
            };
            let progression = locator
                .locations
                .as_ref()
                .and_then(|locations| locations.progression);
            match progression {
                Some(progression) => {
                    println!("position: {} @ {:.2}", locator.href, progression)
                }
                None => println!("position: {}", locator.href),
            }
        }
    })
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "quire.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
