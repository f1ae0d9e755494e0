//! Derived views over live records: finance totals, dashboard counts, list
//! filters, and task reminder helpers.
//!
//! "Today" is passed in as an ISO date so callers (and tests) control the
//! clock; see [`crate::clock::iso_date`].

use std::str::FromStr;

use crate::clock::Millis;
use crate::model::{
    AppState, FinanceEntry, FinanceKind, Patch, Priority, Project, ProjectStatus, Task,
};
use crate::store::{LocalStore, Origin, StoreError};

// ---------------------------------------------------------------------------
// Finances
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FinanceStats {
    pub revenue: f64,
    pub expenses: f64,
    /// Income minus expenses; business and loan entries are tracked apart.
    pub profit: f64,
    /// Borrowed minus repaid.
    pub loan_balance: f64,
    /// Delivered minus collected.
    pub receivables: f64,
}

fn total(entries: &[FinanceEntry], kind: FinanceKind) -> f64 {
    entries
        .iter()
        .filter(|e| e.kind == kind)
        .map(|e| e.amount)
        .sum()
}

pub fn finance_stats(entries: &[FinanceEntry]) -> FinanceStats {
    let income = total(entries, FinanceKind::Income);
    let expense = total(entries, FinanceKind::Expense);
    FinanceStats {
        revenue: income,
        expenses: expense,
        profit: income - expense,
        loan_balance: total(entries, FinanceKind::Loan) - total(entries, FinanceKind::Repayment),
        receivables: total(entries, FinanceKind::BusinessDelivery)
            - total(entries, FinanceKind::BusinessPayment),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinanceView {
    #[default]
    All,
    /// Income and expense entries.
    Profit,
    /// Business deliveries and payments.
    BusinessBalance,
    Only(FinanceKind),
}

impl FinanceView {
    pub fn matches(&self, kind: FinanceKind) -> bool {
        match self {
            FinanceView::All => true,
            FinanceView::Profit => matches!(kind, FinanceKind::Income | FinanceKind::Expense),
            FinanceView::BusinessBalance => matches!(
                kind,
                FinanceKind::BusinessDelivery | FinanceKind::BusinessPayment
            ),
            FinanceView::Only(only) => *only == kind,
        }
    }
}

impl FromStr for FinanceView {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(FinanceView::All),
            "profit" => Ok(FinanceView::Profit),
            "business_balance" => Ok(FinanceView::BusinessBalance),
            other => other
                .parse::<FinanceKind>()
                .map(FinanceView::Only)
                .map_err(|_| format!("unknown finance view: {other}")),
        }
    }
}

/// Inclusive date bounds plus a view. Empty bounds are open.
#[derive(Debug, Clone, Default)]
pub struct FinanceFilter {
    pub from: Option<String>,
    pub to: Option<String>,
    pub view: FinanceView,
}

pub fn filter_finances<'a>(
    entries: &'a [FinanceEntry],
    filter: &FinanceFilter,
) -> Vec<&'a FinanceEntry> {
    entries
        .iter()
        .filter(|e| filter.from.as_deref().map_or(true, |from| e.date.as_str() >= from))
        .filter(|e| filter.to.as_deref().map_or(true, |to| e.date.as_str() <= to))
        .filter(|e| filter.view.matches(e.kind))
        .collect()
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Open and due before `today`. Tasks without a due date are never overdue.
pub fn is_overdue(task: &Task, today: &str) -> bool {
    !task.completed && !task.due_date.is_empty() && task.due_date.as_str() < today
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatusFilter {
    #[default]
    All,
    /// Open and not overdue.
    Active,
    Completed,
    Overdue,
}

impl FromStr for TaskStatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(TaskStatusFilter::All),
            "active" => Ok(TaskStatusFilter::Active),
            "completed" => Ok(TaskStatusFilter::Completed),
            "overdue" => Ok(TaskStatusFilter::Overdue),
            _ => Err(format!("unknown task status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub search: String,
    pub priority: Option<Priority>,
    pub status: TaskStatusFilter,
}

/// Matching tasks, high priority first, then by due date.
pub fn filter_tasks<'a>(tasks: &'a [Task], filter: &TaskFilter, today: &str) -> Vec<&'a Task> {
    let needle = filter.search.to_lowercase();
    let mut matched: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.title.to_lowercase().contains(&needle))
        .filter(|t| filter.priority.map_or(true, |p| t.priority == p))
        .filter(|t| match filter.status {
            TaskStatusFilter::All => true,
            TaskStatusFilter::Active => !t.completed && !is_overdue(t, today),
            TaskStatusFilter::Completed => t.completed,
            TaskStatusFilter::Overdue => is_overdue(t, today),
        })
        .collect();
    matched.sort_by(|a, b| {
        let a_high = a.priority == Priority::High;
        let b_high = b.priority == Priority::High;
        b_high.cmp(&a_high).then_with(|| a.due_date.cmp(&b.due_date))
    });
    matched
}

/// Open tasks whose reminder is at or before `at`.
pub fn due_reminders(tasks: &[Task], at: Millis) -> Vec<&Task> {
    tasks
        .iter()
        .filter(|t| !t.completed && t.reminder_time.is_some_and(|r| r <= at))
        .collect()
}

/// Move a task's reminder to `now + minutes`. `None` if the task is gone.
pub fn snooze_task(
    store: &LocalStore,
    id: &str,
    minutes: u64,
    now: Millis,
) -> Result<Option<Task>, StoreError> {
    if store.get::<Task>(id).is_none() {
        return Ok(None);
    }
    let reminder = now.saturating_add(minutes.saturating_mul(60_000));
    let patch = Patch::new(id).set("reminder_time", reminder);
    store.upsert(patch, Origin::Local).map(Some)
}

/// Flip a task's `completed` flag. `None` if the task is gone.
pub fn toggle_task(store: &LocalStore, id: &str) -> Result<Option<Task>, StoreError> {
    let Some(task) = store.get::<Task>(id) else {
        return Ok(None);
    };
    let patch = Patch::new(id).set("completed", !task.completed);
    store.upsert(patch, Origin::Local).map(Some)
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ProjectFilter {
    pub search: String,
    pub status: Option<ProjectStatus>,
}

pub fn filter_projects<'a>(projects: &'a [Project], filter: &ProjectFilter) -> Vec<&'a Project> {
    let needle = filter.search.to_lowercase();
    projects
        .iter()
        .filter(|p| p.name.to_lowercase().contains(&needle))
        .filter(|p| filter.status.map_or(true, |s| p.status == s))
        .collect()
}

// ---------------------------------------------------------------------------
// Dashboard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dashboard {
    /// Planning or in progress.
    pub active_projects: usize,
    pub tasks_due_today: usize,
    pub high_priority_open: usize,
    pub overdue_tasks: usize,
    pub finances: FinanceStats,
}

/// Counts over a live snapshot (see [`LocalStore::state`]).
pub fn dashboard(state: &AppState, today: &str) -> Dashboard {
    let open = || state.tasks.iter().filter(|t| !t.completed);
    Dashboard {
        active_projects: state
            .projects
            .iter()
            .filter(|p| matches!(p.status, ProjectStatus::Planning | ProjectStatus::InProgress))
            .count(),
        tasks_due_today: open().filter(|t| t.due_date == today).count(),
        high_priority_open: open().filter(|t| t.priority == Priority::High).count(),
        overdue_tasks: open().filter(|t| is_overdue(t, today)).count(),
        finances: finance_stats(&state.finances),
    }
}
