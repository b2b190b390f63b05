//! HTML bodies for the assignment notice and the due-date reminder.
//!
//! Plain string substitution; every interpolated value is escaped.

use chrono::{FixedOffset, Offset, Utc};

use taskpulse_core::TaskSnapshot;

/// Subject and body of a rendered notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub subject: String,
    pub body_html: String,
}

pub fn assignment(task: &TaskSnapshot, origin: &str, offset: FixedOffset) -> Notice {
    Notice {
        subject: format!("New Task Assigned in {}", task.project.name),
        body_html: body(
            task,
            origin,
            offset,
            "You've been assigned a new task:".to_string(),
        ),
    }
}

pub fn reminder(task: &TaskSnapshot, origin: &str, offset: FixedOffset) -> Notice {
    Notice {
        subject: format!("Reminder: Task {} is due in {}", task.title, task.project.name),
        body_html: body(
            task,
            origin,
            offset,
            format!("You have a task due in: {}", escape(&task.project.name)),
        ),
    }
}

fn body(task: &TaskSnapshot, origin: &str, offset: FixedOffset, lead: String) -> String {
    let name = task.assignee.as_ref().map(|a| a.name.as_str()).unwrap_or("there");
    let due = task
        .local_due_date(offset)
        .map(|d| d.format("%-m/%-d/%Y").to_string())
        .unwrap_or_else(|| "No due date".to_string());

    format!(
        r#"<div style="max-width: 600px;">
  <h2>Hello {name}, 👋</h2>
  <p style="font-size:16px;">{lead}</p>
  <p style="font-size:18px; font-weight: bold; color: #007bff; margin: 8px 0;">{title}</p>
  <div style="border: 1px solid #ddd; padding: 12px 16px; border-radius: 6px; margin-bottom: 30px;">
    <p style="margin: 6px 0;"><strong>Description:</strong> {description}</p>
    <p style="margin: 6px 0;"><strong>Due Date:</strong> {due}</p>
  </div>
  <a href="{origin}" style="background-color: #007bff; padding: 12px 24px; border-radius: 5px; color: #fff; font-weight: 600; font-size: 16px; text-decoration: none;">View Task</a>
  <p style="margin-top: 20px; font-size: 14px; color: #6c757d;">Please make sure to review and complete the assigned task before the due date.</p>
</div>"#,
        name = escape(name),
        title = escape(&task.title),
        description = escape(&task.description),
        origin = escape(origin),
    )
}

/// Minimal HTML escaping for text and double-quoted attribute values.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

pub(crate) fn utc() -> FixedOffset {
    Utc.fix()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use taskpulse_core::{Assignee, ProjectRef, TaskId, TaskStatus};

    fn task() -> TaskSnapshot {
        TaskSnapshot {
            id: TaskId::new(),
            title: "Fix <script> bug".into(),
            description: "Tom & Jerry".into(),
            status: TaskStatus::InProgress,
            due_date: Some(Utc.with_ymd_and_hms(2026, 4, 2, 22, 0, 0).unwrap()),
            project: ProjectRef { name: "Apollo".into() },
            assignee: Some(Assignee {
                name: "Sam".into(),
                email: "sam@example.com".into(),
            }),
        }
    }

    #[test]
    fn assignment_subject_and_body() {
        let n = assignment(&task(), "https://app.example.com/p/1", utc());
        assert_eq!(n.subject, "New Task Assigned in Apollo");
        assert!(n.body_html.contains("Hello Sam"));
        assert!(n.body_html.contains("You've been assigned a new task:"));
        assert!(n.body_html.contains(r#"href="https://app.example.com/p/1""#));
        assert!(n.body_html.contains("4/2/2026"));
    }

    #[test]
    fn reminder_subject_names_task_and_project() {
        let n = reminder(&task(), "", utc());
        assert_eq!(n.subject, "Reminder: Task Fix <script> bug is due in Apollo");
        assert!(n.body_html.contains("You have a task due in: Apollo"));
    }

    #[test]
    fn interpolated_values_are_escaped() {
        let n = assignment(&task(), r#"x" onclick="y"#, utc());
        assert!(n.body_html.contains("Fix &lt;script&gt; bug"));
        assert!(n.body_html.contains("Tom &amp; Jerry"));
        assert!(!n.body_html.contains(r#"onclick="y""#));
    }

    #[test]
    fn due_date_uses_local_calendar() {
        let plus_three = FixedOffset::east_opt(3 * 3600).unwrap();
        let n = assignment(&task(), "", plus_three);
        assert!(n.body_html.contains("4/3/2026"));
    }
}
