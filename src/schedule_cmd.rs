use anyhow::Result;
use chrono::Utc;

use crate::config::Config;
use crate::cron::CronExpression;
use crate::db;
use crate::models::ScheduledTask;
use crate::store::{SqliteStore, Store};

/// The next `count` fire times, `-` for inactive tasks, or why the cron
/// text is invalid.
pub fn describe_next_fire(task: &ScheduledTask, count: usize) -> String {
    match CronExpression::parse(&task.cron_expression) {
        Ok(_) if !task.is_active => "-".to_string(),
        Ok(cron) => {
            let times = cron.upcoming(Utc::now(), count.max(1));
            if times.is_empty() {
                return "never".to_string();
            }
            times
                .iter()
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .collect::<Vec<_>>()
                .join(", ")
        }
        Err(e) => format!("INVALID ({})", e),
    }
}

pub async fn list_schedules(config: &Config, next: usize) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let tasks = store.list_tasks(false).await?;

    if tasks.is_empty() {
        println!("No schedules.");
        return Ok(());
    }

    println!(
        "{:<20} {:<18} {:<7} {:<16} NEXT",
        "SCHEDULE", "TYPE", "ACTIVE", "CRON"
    );
    for task in &tasks {
        println!(
            "{:<20} {:<18} {:<7} {:<16} {}",
            task.id,
            task.task_type,
            task.is_active,
            task.cron_expression,
            describe_next_fire(task, next)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskType;

    #[test]
    fn test_describe_next_fire_never() {
        let task = ScheduledTask {
            id: "leap".to_string(),
            name: "leap".to_string(),
            cron_expression: "0 0 30 2 *".to_string(),
            task_type: TaskType::TestTask,
            target_id: None,
            is_active: true,
        };
        assert_eq!(describe_next_fire(&task, 2), "never");
    }

    #[test]
    fn test_describe_next_fire() {
        let mut task = ScheduledTask {
            id: "t".to_string(),
            name: "t".to_string(),
            cron_expression: "0 * * * *".to_string(),
            task_type: TaskType::TestTask,
            target_id: None,
            is_active: true,
        };
        assert!(describe_next_fire(&task, 1).ends_with("UTC"));
        assert!(!describe_next_fire(&task, 1).contains(", "));

        let three = describe_next_fire(&task, 3);
        assert_eq!(three.split(", ").count(), 3);
        assert!(three.split(", ").all(|t| t.ends_with(":00:00 UTC")));

        task.is_active = false;
        assert_eq!(describe_next_fire(&task, 3), "-");

        task.cron_expression = "not-a-cron".to_string();
        assert!(describe_next_fire(&task, 1).starts_with("INVALID"));
    }
}
