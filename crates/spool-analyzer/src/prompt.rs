//! The analysis prompt template. The wording is part of the external
//! contract; change it and downstream report parsers drift.

use spool_db::RunStatus;

/// Builds the user prompt from the trimmed log content and the run outcome.
/// Failed runs get root-cause and fix sections; everything else gets a
/// single observations section.
pub fn build_prompt(log_content: &str, exit_code: i32, status: RunStatus) -> String {
    let mut prompt = String::new();

    prompt.push_str("Analyze the following script execution logs:\n\n");
    prompt.push_str("Execution Status: ");
    prompt.push_str(status.as_str());
    prompt.push('\n');
    prompt.push_str(&format!("Exit Code: {exit_code}\n\n"));
    prompt.push_str("Logs:\n");
    prompt.push_str(log_content);
    prompt.push_str("\n\n");
    prompt.push_str("Please provide:\n");
    prompt.push_str("1. A brief summary of what the script did\n");
    prompt.push_str("2. Key events or milestones\n");
    if status == RunStatus::Failed {
        prompt.push_str("3. The root cause of the failure (specific line/error if possible)\n");
        prompt.push_str("4. Suggested fixes or next steps\n");
    } else {
        prompt.push_str("3. Any warnings or noteworthy observations\n");
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_runs_get_the_observations_section() {
        let prompt = build_prompt("[stdout] done", 0, RunStatus::Completed);

        assert!(prompt.starts_with("Analyze the following script execution logs:\n\n"));
        assert!(prompt.contains("Execution Status: completed\n"));
        assert!(prompt.contains("Exit Code: 0\n\n"));
        assert!(prompt.contains("Logs:\n[stdout] done\n\n"));
        assert!(prompt.ends_with("3. Any warnings or noteworthy observations\n"));
        assert!(!prompt.contains("root cause"));
    }

    #[test]
    fn failed_runs_get_root_cause_and_fix_sections() {
        let prompt = build_prompt("[stderr] boom", 2, RunStatus::Failed);

        assert!(prompt.contains("Execution Status: failed\n"));
        assert!(prompt.contains("Exit Code: 2\n\n"));
        assert!(prompt
            .contains("3. The root cause of the failure (specific line/error if possible)\n"));
        assert!(prompt.ends_with("4. Suggested fixes or next steps\n"));
    }
}
