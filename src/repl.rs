use crate::runtime::App;
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::validate::MatchingBracketValidator;
use rustyline::Editor;
use rustyline_derive::Completer;
use rustyline_derive::Helper;
use rustyline_derive::Highlighter;
use rustyline_derive::Hinter;
use rustyline_derive::Validator;
use std::fs;

/// CLI configuration for REPL.
static CLI_ROOT: &str = ".nano";
static CLI_HISTORY: &str = ".nano_history";

#[derive(Completer, Helper, Highlighter, Hinter, Validator)]
struct RLHelper {
    #[rustyline(Validator)]
    validator: MatchingBracketValidator,
}

impl RLHelper {
    fn new() -> Self {
        Self {
            validator: MatchingBracketValidator::new(),
        }
    }
}

/// Starts the REPL over a loop-less engine instance; `fetch` runs in its
/// synchronous fallback and expressions evaluate in place.
pub fn start(mut runtime: App) {
    let mut editor: Editor<RLHelper, DefaultHistory> = match Editor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}", e);
            return;
        }
    };

    let history_file_path = dirs::home_dir().map(|home| home.join(CLI_ROOT).join(CLI_HISTORY));

    editor.set_helper(Some(RLHelper::new()));
    if let Some(path) = history_file_path.as_ref() {
        let _ = editor.load_history(path);
    }

    let prompt = "> ".to_string();

    loop {
        match editor.readline(&prompt) {
            Ok(line) if line == ".exit" => break,
            Ok(line) => {
                // Update REPL's history file.
                let _ = editor.add_history_entry(&line);

                // Evaluate current expression.
                match runtime.execute_script("<anonymous>", line.trim_end()) {
                    Ok(value) => {
                        let scope = &mut runtime.handle_scope();
                        let value = v8::Local::new(scope, value);
                        let output = value.to_rust_string_lossy(scope);
                        match value.is_undefined() {
                            true => println!("{}", output.dimmed()),
                            false => println!("{}", output),
                        }
                    }
                    Err(e) => eprintln!("{}", e),
                };
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}", e);
                break;
            }
        }
    }

    // Saving REPL's history before exiting.
    if let Some(path) = history_file_path.as_ref() {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = editor.save_history(path);
    }
}
