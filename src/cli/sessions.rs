use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::session::{self, ARCHIVE_ROOT, SESSION_ROOT};

#[derive(Args)]
pub struct SessionsArgs {
    #[command(subcommand)]
    pub command: SessionsCommand,

    /// Session storage root
    #[arg(long, global = true, default_value = SESSION_ROOT)]
    pub root: PathBuf,
}

#[derive(Subcommand)]
pub enum SessionsCommand {
    /// List stored sessions, newest first
    List {
        /// Maximum number of rows
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show the most recent session's summary
    Latest,

    /// Print a session's conversation
    Show {
        /// Session id, id suffix, 1-based list index, or path
        id: String,

        /// Print raw message JSON instead of a transcript
        #[arg(long)]
        raw: bool,
    },

    /// Set or clear a session title
    Title {
        /// Session id, id suffix, 1-based list index, or path
        id: String,

        /// New title; omit to clear
        title: Option<String>,
    },

    /// Merge sessions into a new combined session
    Merge {
        /// Sessions to merge, oldest first
        ids: Vec<String>,

        /// Title for the merged session
        #[arg(short, long)]
        title: Option<String>,
    },

    /// Archive all but the newest session
    Archive {
        /// Archive root directory
        #[arg(long, default_value = ARCHIVE_ROOT)]
        archive_root: PathBuf,

        /// Keep the source files instead of deleting them
        #[arg(long)]
        keep_sources: bool,
    },
}

pub async fn run(args: SessionsArgs) -> Result<()> {
    match args.command {
        SessionsCommand::List { limit } => {
            let sessions = session::list_sessions(&args.root)?;
            if sessions.is_empty() {
                println!("No sessions found.");
                return Ok(());
            }
            let shown = limit.unwrap_or(sessions.len());
            for (index, meta) in sessions.iter().take(shown).enumerate() {
                println!(
                    "{:>3}. {}  turns:{:<3}  updated:{}  title:{}",
                    index + 1,
                    meta.display_name.as_deref().unwrap_or(&meta.id),
                    meta.turn_count(),
                    meta.updated.as_deref().unwrap_or("?"),
                    meta.title.as_deref().unwrap_or("(untitled)"),
                );
            }
            Ok(())
        }

        SessionsCommand::Latest => {
            let sessions = session::list_sessions(&args.root)?;
            match sessions.first() {
                None => println!("No sessions found."),
                Some(meta) => {
                    println!(
                        "Most recent session: {}",
                        meta.display_name.as_deref().unwrap_or(&meta.id)
                    );
                    println!("  id: {}", meta.id);
                    println!("  title: {}", meta.title.as_deref().unwrap_or("(untitled)"));
                    println!("  turns: {}", meta.turn_count());
                    println!("  updated: {}", meta.updated.as_deref().unwrap_or("?"));
                    println!("  path: {}", meta.path);
                }
            }
            Ok(())
        }

        SessionsCommand::Show { id, raw } => {
            let Some(path) = resolve(&id, &args.root)? else {
                anyhow::bail!("no session matches '{id}'");
            };
            let messages = session::load_session_messages(&path);
            if messages.is_empty() {
                println!("Session '{}' is empty or unreadable.", path.display());
                return Ok(());
            }
            let meta = session::load_meta(&path);
            println!(
                "== {} ==",
                meta.display_name.as_deref().unwrap_or(&meta.id)
            );
            if let Some(ref title) = meta.title {
                println!("Title: {title}");
            }
            println!(
                "Model: {}  Turns: {}",
                meta.model.as_deref().unwrap_or("?"),
                meta.turn_count()
            );
            println!("-");
            for message in &messages {
                if raw {
                    println!("{}", serde_json::to_string(message)?);
                } else {
                    println!("{:>10}: {}\n", message.role.as_str().to_uppercase(), message.content);
                }
            }
            Ok(())
        }

        SessionsCommand::Title { id, title } => {
            let Some(path) = resolve(&id, &args.root)? else {
                anyhow::bail!("no session matches '{id}'");
            };
            session::set_session_title(&path, title.as_deref(), title.is_some())?;
            match title {
                Some(title) => println!("Title of {} set to '{title}'.", path.display()),
                None => println!("Title of {} cleared.", path.display()),
            }
            Ok(())
        }

        SessionsCommand::Merge { ids, title } => {
            if ids.len() < 2 {
                anyhow::bail!("merge needs at least two sessions");
            }
            let mut paths = Vec::with_capacity(ids.len());
            for id in &ids {
                match resolve(id, &args.root)? {
                    Some(path) => paths.push(path),
                    None => anyhow::bail!("no session matches '{id}'"),
                }
            }
            let merged = session::merge_sessions(&paths, title.as_deref(), &args.root)?;
            println!("Merged {} sessions into {}", paths.len(), merged.display());
            Ok(())
        }

        SessionsCommand::Archive {
            archive_root,
            keep_sources,
        } => {
            match session::archive_early_sessions(&args.root, &archive_root, !keep_sources)? {
                Some(path) => println!("Archived early sessions to {}", path.display()),
                None => println!("Nothing to archive (fewer than two sessions)."),
            }
            Ok(())
        }
    }
}

/// Resolution with the CLI nicety the store leaves to its callers: a bare
/// number is a 1-based index into the current listing.
fn resolve(identifier: &str, root: &std::path::Path) -> Result<Option<PathBuf>> {
    if let Ok(index) = identifier.parse::<usize>()
        && index >= 1
    {
        let sessions = session::list_sessions(root)?;
        return Ok(sessions.get(index - 1).map(|meta| PathBuf::from(&meta.path)));
    }
    Ok(session::resolve_session(identifier, root))
}
