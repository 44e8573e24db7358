use anyhow::{anyhow, Result};
use bedtime_stories::core::config::Config;
use bedtime_stories::core::model::{EventSpec, GenerationRequest, Hero};
use bedtime_stories::core::session::{GenerationSession, Stage, Step};
use bedtime_stories::services::background::NoSuspension;
use bedtime_stories::services::generation::GenerationCoordinator;
use bedtime_stories::services::http_repository::HttpContentRepository;
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Confirm, Select, Text};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure 'config.yml' exists with a valid backend section.");
            return Err(e);
        }
    };

    let repository = Arc::new(HttpContentRepository::new(&config.backend)?);
    let coordinator = GenerationCoordinator::new(repository, Arc::new(NoSuspension::default()));

    let request = prompt_request(&config)?;
    coordinator.start(request)?;

    loop {
        let session = follow_progress(&coordinator).await;
        match &session.stage {
            Stage::Completed => {
                print_story(&session);
                return Ok(());
            }
            Stage::Failed { step, error } => {
                eprintln!("Generation failed at the {} stage: {}", step, error);
                if !offer_recovery(&coordinator, *step)? {
                    if session.story.is_some() {
                        println!("The story text was kept. Narration is generated on first play.");
                    }
                    return Err(anyhow!("Story generation did not complete"));
                }
            }
            Stage::Idle => return Err(anyhow!("Story generation was cancelled")),
            Stage::Running(_) => unreachable!("follow_progress returns a settled session"),
        }
    }
}

fn prompt_request(config: &Config) -> Result<GenerationRequest> {
    let name = Text::new("Hero name:").prompt()?;
    let avatar = Text::new("Hero avatar (path or URL, leave empty for none):").prompt()?;
    let event = Text::new("What happens tonight?")
        .with_default("bedtime")
        .prompt()?;

    let hero = Hero {
        id: name.to_lowercase().replace(' ', "_"),
        name,
        avatar_ref: Some(avatar).filter(|a| !a.trim().is_empty()),
    };
    Ok(GenerationRequest::new(hero, EventSpec::new(event), &config.generation))
}

/// Renders progress until the session settles.
async fn follow_progress(coordinator: &GenerationCoordinator) -> GenerationSession {
    let pb = ProgressBar::new(100);
    if let Ok(style) = ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}") {
        pb.set_style(style.progress_chars("#>-"));
    }

    let mut rx = coordinator.subscribe();
    loop {
        let session = rx.borrow_and_update().clone();
        pb.set_position((session.progress * 100.0).round() as u64);
        pb.set_message(session.stage.to_string());
        if !session.stage.is_running() {
            pb.finish_with_message(session.stage.to_string());
            return session;
        }
        if rx.changed().await.is_err() {
            pb.abandon();
            return coordinator.session();
        }
    }
}

/// Returns true when a retry or skip was started.
fn offer_recovery(coordinator: &GenerationCoordinator, step: Step) -> Result<bool> {
    match step {
        Step::Story => Ok(false),
        Step::Audio => {
            if Confirm::new("Retry narration?").with_default(true).prompt()? {
                coordinator.retry_stage(Step::Audio)?;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        Step::Illustrations => {
            let choice = Select::new(
                "Illustrations failed:",
                vec!["Retry illustrations", "Continue without illustrations", "Quit"],
            )
            .prompt()?;
            match choice {
                "Retry illustrations" => {
                    coordinator.retry_stage(Step::Illustrations)?;
                    Ok(true)
                }
                "Continue without illustrations" => {
                    coordinator.skip_stage(Step::Illustrations)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }
}

fn print_story(session: &GenerationSession) {
    let Some(story) = &session.story else {
        println!("Session completed without a story.");
        return;
    };
    let story = story.read();
    println!("\n{}\n", story.title);
    println!("{}\n", story.content);
    if let Some(audio) = &story.audio_ref {
        println!("Narration: {}", audio);
    }
    for illustration in &story.illustrations {
        println!(
            "Scene {} at {:.1}s: {}",
            illustration.display_order,
            illustration.timestamp,
            illustration.image_ref.as_deref().unwrap_or("(placeholder)")
        );
    }
}
