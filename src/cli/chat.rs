use anyhow::Result;
use clap::Args;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{self, Write};
use std::time::Duration;

use super::RuntimeArgs;
use crate::core::{ChatClient, NoRuntimeError};
use crate::session;

#[derive(Args)]
pub struct ChatArgs {
    #[command(flatten)]
    pub runtime: RuntimeArgs,

    /// Disable token streaming (replies print once complete)
    #[arg(long)]
    pub no_stream: bool,

    /// System preamble for the conversation
    #[arg(long)]
    pub system: Option<String>,

    /// Resume an existing session by id, suffix, or path
    #[arg(short, long)]
    pub resume: Option<String>,
}

pub async fn run(args: ChatArgs) -> Result<()> {
    let stream = !args.no_stream;
    let options = args.runtime.client_options(stream, true);
    let candidates = args.runtime.candidates(&options);

    let mut client =
        match ChatClient::connect_first_reachable(&candidates, &options, Duration::from_secs(1)) {
            Ok(client) => client,
            Err(error) => {
                if error.downcast_ref::<NoRuntimeError>().is_some() {
                    eprintln!("{error}");
                    std::process::exit(2);
                }
                return Err(error);
            }
        };

    if let Some(ref system) = args.system {
        client.reset_messages(Some(system));
    }

    if let Some(ref identifier) = args.resume {
        match session::resolve_session(identifier, &args.runtime.session_root) {
            Some(path) => {
                let messages = session::load_session_messages(&path);
                let turns = messages.iter().filter(|m| m.role == crate::core::Role::User).count();
                client.set_messages(messages);
                client.adopt_session_log(&path)?;
                println!("Resumed {} ({turns} turns)\n", path.display());
            }
            None => {
                eprintln!("No session matches '{identifier}'; starting fresh.\n");
            }
        }
    }

    let persona = client.persona();
    println!(
        "Central v{} | {} ({}) | {} | {}",
        env!("CARGO_PKG_VERSION"),
        persona.variant_name,
        client.model(),
        client.url(),
        persona.tagline,
    );
    println!("Type /help for commands, /quit to exit\n");

    let mut editor = DefaultEditor::new()?;
    let mut stdout = io::stdout();

    loop {
        let line = match editor.readline("You: ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(error) => {
                eprintln!("Error: {error:?}");
                break;
            }
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(input);

        if input.starts_with('/') {
            match handle_command(input, &mut client, &args.runtime)? {
                CommandResult::Continue => continue,
                CommandResult::Quit => break,
            }
        }

        print!("\nCentral: ");
        stdout.flush()?;

        let reply = run_turn(&mut client, input, stream, &mut stdout).await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(error) => {
                eprintln!("\nError: {error}\n");
                continue;
            }
        };
        println!("\n");

        if let Err(error) = client.ensure_auto_title() {
            eprintln!("Warning: failed to update session title: {error}");
        }

        // The model asked for an external instrument: let the operator
        // paste its output and stitch it back into the conversation.
        if let Some(ref text) = reply
            && ChatClient::wants_instrument(text)
        {
            match editor.readline("Instrument result> ") {
                Ok(result) if !result.trim().is_empty() => {
                    print!("\nCentral: ");
                    stdout.flush()?;
                    match stitch_instrument(&mut client, result.trim(), stream, &mut stdout)
                        .await
                    {
                        Ok(_) => println!("\n"),
                        Err(error) => eprintln!("\nError: {error}\n"),
                    }
                }
                Ok(_) | Err(ReadlineError::Interrupted) => {
                    println!("(no instrument result provided)\n");
                }
                Err(ReadlineError::Eof) => break,
                Err(error) => {
                    eprintln!("Error: {error:?}");
                    break;
                }
            }
        }
    }

    finalise_session(&client);
    println!("Goodbye.");
    Ok(())
}

async fn run_turn(
    client: &mut ChatClient,
    input: &str,
    stream: bool,
    stdout: &mut io::Stdout,
) -> Result<Option<String>> {
    if stream {
        let mut sink = |piece: &str| {
            print!("{piece}");
            let _ = io::stdout().flush();
        };
        client.one_turn(input, Some(&mut sink)).await
    } else {
        let reply = client.one_turn(input, None).await?;
        if let Some(ref text) = reply {
            print!("{text}");
            stdout.flush()?;
        }
        Ok(reply)
    }
}

async fn stitch_instrument(
    client: &mut ChatClient,
    result: &str,
    stream: bool,
    stdout: &mut io::Stdout,
) -> Result<Option<String>> {
    if stream {
        let mut sink = |piece: &str| {
            print!("{piece}");
            let _ = io::stdout().flush();
        };
        client.process_instrument_result(result, Some(&mut sink)).await
    } else {
        let reply = client.process_instrument_result(result, None).await?;
        if let Some(ref text) = reply {
            print!("{text}");
            stdout.flush()?;
        }
        Ok(reply)
    }
}

fn finalise_session(client: &ChatClient) {
    match client.maybe_delete_empty_session() {
        Ok(true) => {}
        Ok(false) => {
            if let Err(error) = client.append_session_to_day_log() {
                eprintln!("Warning: failed to update day log: {error}");
            }
        }
        Err(error) => eprintln!("Warning: failed to clean up session: {error}"),
    }
}

enum CommandResult {
    Continue,
    Quit,
}

fn handle_command(
    input: &str,
    client: &mut ChatClient,
    runtime: &RuntimeArgs,
) -> Result<CommandResult> {
    let mut parts = input.split_whitespace();
    let command = parts.next().unwrap_or("");
    let rest = input[command.len()..].trim();

    match command {
        "/quit" | "/exit" | "/q" => Ok(CommandResult::Quit),

        "/help" | "/h" | "/?" => {
            println!("\nCommands:");
            println!("  /sessions        List stored sessions");
            println!("  /title <text>    Name this session");
            println!("  /target          Show the configured runtime");
            println!("  /quit            Exit\n");
            Ok(CommandResult::Continue)
        }

        "/sessions" => {
            let sessions = session::list_sessions(&runtime.session_root)?;
            if sessions.is_empty() {
                println!("\nNo stored sessions.\n");
            } else {
                println!();
                for (index, meta) in sessions.iter().take(10).enumerate() {
                    println!(
                        "  {}. {}  turns:{}  {}",
                        index + 1,
                        meta.display_name.as_deref().unwrap_or(&meta.id),
                        meta.turn_count(),
                        meta.title.as_deref().unwrap_or("(untitled)"),
                    );
                }
                if sessions.len() > 10 {
                    println!("  ... and {} more", sessions.len() - 10);
                }
                println!();
            }
            Ok(CommandResult::Continue)
        }

        "/title" => {
            if rest.is_empty() {
                match client.get_session_title() {
                    Some(title) => println!("\nTitle: {title}\n"),
                    None => println!("\nNo title set.\n"),
                }
            } else {
                client.set_session_title(rest, true)?;
                println!("\nTitle set.\n");
            }
            Ok(CommandResult::Continue)
        }

        "/target" => {
            println!(
                "\n{}\n",
                serde_json::to_string_pretty(&client.describe_target())?
            );
            Ok(CommandResult::Continue)
        }

        _ => {
            eprintln!("Unknown command: {command}. Type /help for commands.");
            Ok(CommandResult::Continue)
        }
    }
}
