use anyhow::Result;

use crate::agent::{Interaction, Phase};
use crate::util::{ask, ask_or_eof};

/// Terminal front end for the loop. All printing the loop causes goes
/// through here; the loop itself never touches stdout.
#[derive(Default)]
pub struct ConsoleUi;

impl Interaction for ConsoleUi {
    fn notify(&mut self, phase: Phase, content: &str) {
        match phase {
            Phase::Planning => println!("(planning)"),
            Phase::Classifying => {}
            Phase::Executing => println!("$ {content}"),
            Phase::AwaitingConfirmation => println!("(needs confirmation) {content}"),
            Phase::Concluding => println!("{content}"),
        }
    }

    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        let answer = ask(&format!("{prompt} [y/N] "))?;
        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    }

    fn clarify(&mut self, question: &str) -> Result<Option<String>> {
        println!("{question}");
        let answer = ask_or_eof("> ")?;
        Ok(answer.filter(|a| !a.trim().is_empty()))
    }
}
