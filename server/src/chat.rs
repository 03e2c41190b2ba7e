//! In-game chat commands.

use shared::Team;

pub const SUB_USAGE: &str = "!sub is for replacing yourself, !rep reports others.";
pub const REP_USAGE: &str = "Usage: !rep our/their/red/blu slotname";

/// Team argument of `!rep`, relative to the reporter or absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeamArg {
    Our,
    Their,
    Red,
    Blu,
}

impl TeamArg {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "our" => Some(TeamArg::Our),
            "their" => Some(TeamArg::Their),
            "red" => Some(TeamArg::Red),
            "blu" | "blue" => Some(TeamArg::Blu),
            _ => None,
        }
    }

    /// The team this argument names, seen from a reporter on `reporter`.
    pub fn resolve(&self, reporter: Team) -> Team {
        match self {
            TeamArg::Our => reporter,
            TeamArg::Their => reporter.opposite(),
            TeamArg::Red => Team::Red,
            TeamArg::Blu => Team::Blu,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Report { team: TeamArg, slot: String },
    /// `!rep` that could not be understood
    ReportUsage,
    Sub,
    /// `!sub` followed by something, usually a misplaced `!rep`
    SubWithArgument,
    /// Re-runs the anti-idle config
    SoapOff,
}

impl ChatCommand {
    pub fn parse(text: &str) -> Option<ChatCommand> {
        let mut words = text.split_whitespace();
        let command = words.next()?.to_ascii_lowercase();
        let args: Vec<&str> = words.collect();

        match command.as_str() {
            "!sub" if args.is_empty() => Some(ChatCommand::Sub),
            "!sub" => Some(ChatCommand::SubWithArgument),
            "!soapoff" => Some(ChatCommand::SoapOff),
            "!rep" => {
                let Some((team, slot)) = args.split_first() else {
                    return Some(ChatCommand::ReportUsage);
                };
                match TeamArg::parse(team) {
                    Some(team) if !slot.is_empty() => Some(ChatCommand::Report {
                        team,
                        slot: slot.join(" "),
                    }),
                    _ => Some(ChatCommand::ReportUsage),
                }
            }
            _ => None,
        }
    }
}
