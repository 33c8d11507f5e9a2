//! Fixed tasks and system prompts for the two variants

use crate::LoopMode;

/// Default task of the autonomous analyst
pub const ANALYST_TASK: &str = "Please begin. Step 1: compute mean+std from 'aorta' in dsc.csv.\n\
Step 2: load the challengeR library in R and print its version. Then output your final answer.";

/// Default task of the human-in-the-loop variant
pub const FEEDBACK_TASK: &str =
    "Compute mean and std dev from the 'aorta' column in dsc.csv. Say when you are done.";

/// Shown to the coder when its message had no runnable block
pub const NO_CODE_NOTICE: &str =
    "(No R code found in your message. Start your R code block with ```r and end it with ```)";

/// Build the coder's system prompt for `mode`.
pub fn system_prompt(mode: LoopMode, completion_token: &str) -> String {
    let intro = match mode {
        LoopMode::Autonomous => {
            "You are an R coder guiding an R executor bot that runs your code. \
             The bot runs the code it finds in your answer and gives you back the results. \
             It never asks you questions. It is your job to iteratively write code until \
             the goals in the task are met."
        }
        LoopMode::HumanInTheLoop => {
            "You are an R coder directing a live R session to achieve a goal. \
             Variables you create stay available between turns. A human reviews every \
             result and may send corrections or new instructions."
        }
    };

    format!(
        "{intro}\n\n\
         IMPORTANT:\n\
         1. The executor only runs code in a correctly fenced block. Always produce exactly ONE block:\n\
         ```r\n# your code\n```\n\
         2. Put explanations and summaries outside that block.\n\
         3. Only the first ```r block of a message is run.\n\
         4. If you get an ERROR, fix the code and try again.\n\
         5. When every goal has succeeded, write a plain-text summary and say '{completion_token}' \
         outside any code block."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_mentions_token_and_fence() {
        let prompt = system_prompt(LoopMode::Autonomous, "DONE");
        assert!(prompt.contains("'DONE'"));
        assert!(prompt.contains("```r\n# your code\n```"));
    }

    #[test]
    fn test_prompt_varies_by_mode() {
        let auto = system_prompt(LoopMode::Autonomous, "DONE");
        let human = system_prompt(LoopMode::HumanInTheLoop, "TASK_COMPLETE");
        assert_ne!(auto, human);
        assert!(human.contains("human reviews"));
        assert!(human.contains("TASK_COMPLETE"));
    }

    #[test]
    fn test_tasks_do_not_contain_completion_token() {
        assert!(!ANALYST_TASK.contains("DONE"));
        assert!(!FEEDBACK_TASK.contains("DONE"));
    }
}
