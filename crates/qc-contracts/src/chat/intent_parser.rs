use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SAMPLE_COMMANDS, SINGLE_PATH_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            command_args: BTreeMap::new(),
        }
    }

    fn with_arg(mut self, key: &str, value: Value) -> Self {
        self.command_args.insert(key.to_string(), value);
        self
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.command_args.get(key).and_then(Value::as_str)
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn split_words(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_single_path_arg(arg: &str) -> String {
    let parts = split_words(arg);
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

/// Byte offset just past the first shell word, honouring quotes and backslashes.
fn first_word_end(arg: &str) -> usize {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, ch) in arg.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match quote {
            Some(open) if ch == open => quote = None,
            Some('"') if ch == '\\' => escaped = true,
            Some(_) => {}
            None if ch == '\\' => escaped = true,
            None if ch == '"' || ch == '\'' => quote = Some(ch),
            None if ch.is_whitespace() => return idx,
            None => {}
        }
    }
    arg.len()
}

/// First shell word is the image path; the rest of the line is the annotation, as typed.
fn parse_sample_args(arg: &str) -> (String, Option<String>) {
    let arg = arg.trim_start();
    let (word, rest) = arg.split_at(first_word_end(arg));
    let path = split_words(word).concat();
    let annotation = rest.trim_start();
    if annotation.is_empty() {
        (path, None)
    } else {
        (path, Some(annotation.to_string()))
    }
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let key = match action {
                    "set_instruction" => "instruction",
                    "set_model" => "model",
                    _ => "selection",
                };
                return Intent::new(action, text).with_arg(key, Value::String(arg.to_string()));
            }

            if let Some(action) = find_action(&command, SAMPLE_COMMANDS) {
                let (path, annotation) = parse_sample_args(arg);
                return Intent::new(action, text)
                    .with_arg("path", Value::String(path))
                    .with_arg(
                        "annotation",
                        annotation.map(Value::String).unwrap_or(Value::Null),
                    );
            }

            if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
                return Intent::new(action, text)
                    .with_arg("path", Value::String(parse_single_path_arg(arg)));
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            return Intent::new("unknown", text)
                .with_arg("command", Value::String(command))
                .with_arg("arg", Value::String(arg.to_string()));
        }
    }

    Intent::new("set_instruction", text)
        .with_arg("instruction", Value::String(raw_trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::parse_intent;

    #[test]
    fn parse_sample_with_quoted_path_and_annotation() {
        let intent = parse_intent("/good \"/tmp/belt 1/box.png\" clean box,  square edges");
        assert_eq!(intent.action, "add_good");
        assert_eq!(intent.command_args["path"], json!("/tmp/belt 1/box.png"));
        assert_eq!(
            intent.command_args["annotation"],
            json!("clean box,  square edges")
        );
    }

    #[test]
    fn sample_annotation_keeps_quotes_and_backslashes() {
        let intent = parse_intent("/bad belt\\ 2/dent.jpg it's \"crushed\"   at C:\\edge");
        assert_eq!(intent.action, "add_bad");
        assert_eq!(intent.arg_str("path"), Some("belt 2/dent.jpg"));
        assert_eq!(
            intent.arg_str("annotation"),
            Some("it's \"crushed\"   at C:\\edge")
        );
    }

    #[test]
    fn parse_sample_without_annotation() {
        let intent = parse_intent("/bad dent.jpg");
        assert_eq!(intent.action, "add_bad");
        assert_eq!(intent.arg_str("path"), Some("dent.jpg"));
        assert_eq!(intent.command_args["annotation"], Value::Null);
    }

    #[test]
    fn parse_single_path_commands() {
        let analyze = parse_intent("/analyze \"/tmp/a b.png\"");
        assert_eq!(analyze.action, "analyze");
        assert_eq!(analyze.arg_str("path"), Some("/tmp/a b.png"));

        let browse = parse_intent("  /browse quality-control-images/Random  ");
        assert_eq!(browse.action, "browse");
        assert_eq!(browse.arg_str("path"), Some("quality-control-images/Random"));
    }

    #[test]
    fn parse_raw_argument_commands() {
        let prompt = parse_intent("/prompt Is the tape   intact?");
        assert_eq!(prompt.action, "set_instruction");
        assert_eq!(prompt.arg_str("instruction"), Some("Is the tape   intact?"));

        let model = parse_intent("/MODEL gpt-4-vision-preview");
        assert_eq!(model.action, "set_model");
        assert_eq!(model.arg_str("model"), Some("gpt-4-vision-preview"));

        let pick = parse_intent("/pick 2");
        assert_eq!(pick.action, "pick");
        assert_eq!(pick.arg_str("selection"), Some("2"));
    }

    #[test]
    fn parse_no_arg_commands() {
        for (input, action) in [
            ("/save", "save"),
            ("/samples", "list_samples"),
            ("/models", "list_models"),
            ("/reset", "reset"),
            ("/help", "help"),
            ("/quit", "quit"),
        ] {
            assert_eq!(parse_intent(input).action, action);
        }
    }

    #[test]
    fn plain_text_sets_instruction_and_blank_is_noop() {
        let intent = parse_intent("  Look for torn tape  ");
        assert_eq!(intent.action, "set_instruction");
        assert_eq!(intent.arg_str("instruction"), Some("Look for torn tape"));
        assert_eq!(parse_intent("   ").action, "noop");
    }

    #[test]
    fn parse_unknown_command() {
        let intent = parse_intent("/magic foo bar");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("magic"));
        assert_eq!(intent.command_args["arg"], json!("foo bar"));
    }
}
