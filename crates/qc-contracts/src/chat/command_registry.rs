#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Commands whose whole argument is taken as raw text.
pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "prompt",
        action: "set_instruction",
    },
    CommandSpec {
        command: "model",
        action: "set_model",
    },
    CommandSpec {
        command: "pick",
        action: "pick",
    },
];

/// Commands taking a path followed by an optional annotation.
pub(crate) const SAMPLE_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "good",
        action: "add_good",
    },
    CommandSpec {
        command: "bad",
        action: "add_bad",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "analyze",
        action: "analyze",
    },
    CommandSpec {
        command: "browse",
        action: "browse",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "save",
        action: "save",
    },
    CommandSpec {
        command: "samples",
        action: "list_samples",
    },
    CommandSpec {
        command: "models",
        action: "list_models",
    },
    CommandSpec {
        command: "reset",
        action: "reset",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/good PATH [ANNOTATION]",
    "/bad PATH [ANNOTATION]",
    "/prompt TEXT",
    "/model NAME",
    "/models",
    "/analyze PATH",
    "/browse DIR",
    "/pick NAME|INDEX",
    "/save",
    "/samples",
    "/reset",
    "/help",
    "/quit",
];
