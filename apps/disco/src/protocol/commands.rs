use super::PhoneMessage;

/// Protocol commands the phone can send. String-valued commands go out as
/// custom identifiers, numeric-valued ones as raw input codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Accept,
    Back,
    Pause,
    Options,
    ChangeButtons,
    Up,
    Down,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandValue {
    Identifier(&'static str),
    Input(u32),
}

impl Command {
    pub fn value(self) -> CommandValue {
        match self {
            Command::Accept => CommandValue::Identifier("ACCEPT"),
            Command::Back => CommandValue::Identifier("BACK"),
            Command::Pause => CommandValue::Identifier("PAUSE"),
            Command::Options => CommandValue::Identifier("OPTIONS"),
            Command::ChangeButtons => CommandValue::Identifier("CHANGE_BUTTONS"),
            Command::Up => CommandValue::Input(3690595578),
            Command::Right => CommandValue::Input(1099935642),
            Command::Down => CommandValue::Input(2467711647),
            Command::Left => CommandValue::Input(3652315484),
        }
    }

    /// Map a console-advertised `shortcutType` code to a command. Unknown
    /// codes yield `None` and the entry is dropped by the caller.
    pub fn from_shortcut_type(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Command::Accept),
            1 => Some(Command::Back),
            2 => Some(Command::Pause),
            3 => Some(Command::Options),
            4 => Some(Command::ChangeButtons),
            5 => Some(Command::Up),
            6 => Some(Command::Down),
            7 => Some(Command::Left),
            8 => Some(Command::Right),
            _ => None,
        }
    }

    /// Build the wire message for this command. Pause has a dedicated
    /// message kind.
    pub fn to_message(self) -> PhoneMessage {
        if self == Command::Pause {
            return PhoneMessage::Pause;
        }
        match self.value() {
            CommandValue::Identifier(identifier) => PhoneMessage::CustomIdentifier { identifier },
            CommandValue::Input(input) => PhoneMessage::InputCode { input },
        }
    }
}

/// Physical controller buttons exposed by the input source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    A,
    B,
    Plus,
    Minus,
    One,
    Two,
    Up,
    Down,
    Left,
    Right,
}

/// One button transition reported by the input source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    pub button: Button,
    pub pressed: bool,
}

impl Button {
    /// Static candidate commands for this button, consulted only while input
    /// is accepted.
    pub fn candidate_commands(self) -> &'static [Command] {
        match self {
            Button::A => &[Command::Accept],
            Button::B => &[Command::Back],
            Button::Plus => &[Command::Pause],
            Button::Minus => &[Command::Options],
            Button::One | Button::Two => &[Command::ChangeButtons],
            Button::Up => &[Command::Up],
            Button::Down => &[Command::Down],
            Button::Left => &[Command::Left],
            Button::Right => &[Command::Right],
        }
    }
}
