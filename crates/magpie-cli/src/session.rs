use anyhow::Result;
use console::style;
use magpie::agent::Agent;
use magpie::models::message::MessageContent;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub struct Session {
    agent: Agent,
}

impl Session {
    pub fn new(agent: Agent) -> Self {
        Session { agent }
    }

    pub async fn start(mut self) -> Result<()> {
        let mut editor = DefaultEditor::new()?;

        loop {
            let line = match editor.readline(&format!("{} ", style("magpie>").cyan().bold())) {
                Ok(line) => line,
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(err) => return Err(err.into()),
            };

            let input = line.trim();
            if input.is_empty() {
                continue;
            }
            if matches!(input, "exit" | "quit") {
                break;
            }
            let _ = editor.add_history_entry(input);

            let before = self.agent.transcript().len();
            let answer = self.agent.run(input).await;
            self.render_tool_steps(before);

            println!("\n{answer}\n");
        }

        println!("{}", style("Closing session.").dim());
        Ok(())
    }

    /// Show what tools ran during the last turn.
    fn render_tool_steps(&self, since: usize) {
        for message in &self.agent.transcript()[since..] {
            for content in &message.content {
                match content {
                    MessageContent::ToolRequest(request) => match &request.tool_call {
                        Ok(call) => println!(
                            "{} {}({})",
                            style("tool:").magenta(),
                            style(&call.name).bold(),
                            call.arguments
                        ),
                        Err(err) => {
                            println!("{} {}", style("tool request error:").red(), err)
                        }
                    },
                    MessageContent::ToolResponse(response) => match &response.tool_result {
                        Ok(_) => println!("{} {}", style("  ->").green(), "ok"),
                        Err(err) => println!("{} {}", style("  ->").red(), err),
                    },
                    MessageContent::Text(_) => {}
                }
            }
        }
    }
}
