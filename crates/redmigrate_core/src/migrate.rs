use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;

use crate::assembla::{AssemblaApi, Ticket, WikiPage};
use crate::assets::AssetStore;
use crate::config::MigrationConfig;
use crate::convert::convert_html;
use crate::markup::convert_comment;
use crate::redmine::{IssuePayload, IssueUpdate, RedmineApi, RedmineError, WikiPagePayload};

/// Placeholder body for pages whose converted text comes out empty; Redmine
/// rejects blank wiki text.
const EMPTY_PAGE_TEXT: &str = "---";

const ENTITY_REPLACEMENTS: &[(&str, &str)] = &[
    ("&nbsp;", " "),
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&#39;", "'"),
    ("&amp;", "&"),
];

#[derive(Debug, Clone, Serialize)]
pub struct PageResult {
    pub title: String,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageMigrationReport {
    pub requested: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub stranded: usize,
    pub errors: Vec<String>,
    pub pages: Vec<PageResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketResult {
    pub number: i64,
    pub subject: String,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketMigrationReport {
    pub requested: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub comments_applied: usize,
    pub errors: Vec<String>,
    pub tickets: Vec<TicketResult>,
}

/// Migrate every wiki page of the configured space, parents before children.
///
/// A page whose parent has not uploaded yet is requeued; a full cycle
/// through the queue with no progress means the remaining parents never
/// materialize, so the leftovers are reported instead of looping.
pub fn migrate_wiki_pages<A: AssemblaApi + ?Sized, R: RedmineApi + ?Sized>(
    api: &mut A,
    redmine: &mut R,
    store: &AssetStore,
) -> Result<PageMigrationReport> {
    let pages = api.wiki_pages().context("failed to list wiki pages")?;
    let names: BTreeMap<String, String> = pages
        .iter()
        .map(|page| (page.id.clone(), page.page_name.clone()))
        .collect();

    let mut report = PageMigrationReport {
        requested: pages.len(),
        created: 0,
        updated: 0,
        skipped: 0,
        stranded: 0,
        errors: Vec::new(),
        pages: Vec::new(),
    };

    let mut queue: VecDeque<WikiPage> = pages.into();
    let mut has_seen: BTreeSet<String> = BTreeSet::new();
    let mut requeued = 0usize;

    while let Some(page) = queue.pop_front() {
        if let Some(parent_id) = &page.parent_id
            && !has_seen.contains(parent_id)
        {
            requeued += 1;
            queue.push_back(page);
            if requeued > queue.len() {
                break;
            }
            continue;
        }
        requeued = 0;
        has_seen.insert(page.id.clone());

        match upload_wiki_page(api, redmine, store, &page, &names) {
            Ok(result) => {
                match result.action.as_str() {
                    "created" => report.created += 1,
                    _ => report.updated += 1,
                }
                report.pages.push(result);
            }
            Err(error) => {
                report.skipped += 1;
                report
                    .errors
                    .push(format!("{}: {error:#}", page.page_name));
                report.pages.push(PageResult {
                    title: page.page_name.clone(),
                    action: "skipped".to_string(),
                    detail: Some(format!("{error:#}")),
                });
            }
        }
    }

    for page in queue {
        report.stranded += 1;
        report.errors.push(format!(
            "{}: parent page was never migrated",
            page.page_name
        ));
        report.pages.push(PageResult {
            title: page.page_name,
            action: "stranded".to_string(),
            detail: None,
        });
    }

    Ok(report)
}

fn upload_wiki_page<A: AssemblaApi + ?Sized, R: RedmineApi + ?Sized>(
    api: &mut A,
    redmine: &mut R,
    store: &AssetStore,
    page: &WikiPage,
    names: &BTreeMap<String, String>,
) -> Result<PageResult> {
    let contents = page.contents.as_deref().unwrap_or("");
    let conversion = convert_html(contents, api, store);
    let text = unescape_entities(&conversion.text);

    let payload = WikiPagePayload {
        title: strip_title(&page.page_name),
        text: if text.is_empty() {
            EMPTY_PAGE_TEXT.to_string()
        } else {
            text
        },
        parent_title: page
            .parent_id
            .as_ref()
            .and_then(|parent_id| names.get(parent_id))
            .map(|name| strip_title(name)),
        uploads: conversion.uploads,
    };

    match redmine.create_wiki_page(&payload) {
        Ok(()) => Ok(PageResult {
            title: payload.title,
            action: "created".to_string(),
            detail: None,
        }),
        Err(RedmineError::Validation(detail)) => {
            redmine
                .update_wiki_page(&payload)
                .with_context(|| format!("update fallback failed for {}", payload.title))?;
            Ok(PageResult {
                title: payload.title,
                action: "updated".to_string(),
                detail: Some(detail),
            })
        }
        Err(error) => Err(error.into()),
    }
}

/// Migrate every ticket of the configured space, then replay its comments
/// oldest-first as issue notes. Failures are per-ticket: the batch continues.
pub fn migrate_tickets<A: AssemblaApi + ?Sized, R: RedmineApi + ?Sized>(
    api: &mut A,
    redmine: &mut R,
    store: &AssetStore,
    config: &MigrationConfig,
) -> Result<TicketMigrationReport> {
    let space_id = api.space_id().context("failed to resolve space id")?;
    let tickets = api.tickets().context("failed to list tickets")?;

    let mut report = TicketMigrationReport {
        requested: tickets.len(),
        migrated: 0,
        skipped: 0,
        comments_applied: 0,
        errors: Vec::new(),
        tickets: Vec::new(),
    };

    for ticket in tickets {
        match upload_ticket(api, redmine, store, config, &space_id, &ticket) {
            Ok(comments_applied) => {
                report.migrated += 1;
                report.comments_applied += comments_applied;
                report.tickets.push(TicketResult {
                    number: ticket.number,
                    subject: ticket.summary.clone(),
                    action: "created".to_string(),
                    detail: None,
                });
            }
            Err(error) => {
                report.skipped += 1;
                report.errors.push(format!("{}: {error:#}", ticket.summary));
                report.tickets.push(TicketResult {
                    number: ticket.number,
                    subject: ticket.summary.clone(),
                    action: "skipped".to_string(),
                    detail: Some(format!("{error:#}")),
                });
            }
        }
    }

    Ok(report)
}

fn upload_ticket<A: AssemblaApi + ?Sized, R: RedmineApi + ?Sized>(
    api: &mut A,
    redmine: &mut R,
    store: &AssetStore,
    config: &MigrationConfig,
    space_id: &str,
    ticket: &Ticket,
) -> Result<usize> {
    let start_date = date_part(&ticket.created_on).to_string();
    let due_date = ticket
        .due_date
        .clone()
        .filter(|date| !date.is_empty())
        .unwrap_or_else(|| start_date.clone());
    // a due date before creation confuses Redmine's validation
    let due_date = if due_date < start_date {
        start_date.clone()
    } else {
        due_date
    };

    let status = ticket.status.as_deref().unwrap_or_default();
    let status_id = config.status_id(status);
    let priority_id = config
        .priority_id(ticket.priority)
        .ok_or_else(|| anyhow!("no priority mapping for source priority {}", ticket.priority))?;
    let tracker_id = config.tracker_id();

    let issue_id = redmine
        .create_issue(&IssuePayload {
            subject: ticket.summary.clone(),
            description: ticket.description.clone().unwrap_or_default(),
            tracker_id,
            status_id,
            priority_id,
            start_date,
            due_date,
        })
        .context("failed to create issue")?;

    // Redmine ignores a non-default status on create; re-apply it
    redmine
        .update_issue(
            issue_id,
            &IssueUpdate {
                tracker_id,
                status_id,
                priority_id,
                notes: None,
                uploads: Vec::new(),
            },
        )
        .context("failed to apply status after create")?;

    let comments = api
        .ticket_comments(ticket.number)
        .context("failed to list ticket comments")?;

    let mut applied = 0usize;
    // the listing is reverse-chronological; replay oldest first
    for comment in comments.iter().rev() {
        let Some(text) = comment.comment.as_deref().filter(|text| !text.is_empty()) else {
            continue;
        };
        let conversion = convert_comment(text, space_id, api, store)?;
        redmine
            .update_issue(
                issue_id,
                &IssueUpdate {
                    tracker_id,
                    status_id,
                    priority_id,
                    notes: Some(conversion.text),
                    uploads: conversion.uploads,
                },
            )
            .context("failed to apply comment")?;
        applied += 1;
    }

    Ok(applied)
}

/// Undo the entity escaping the source platform leaves in exported HTML.
/// `&amp;` goes last so it cannot manufacture new entities.
pub fn unescape_entities(text: &str) -> String {
    let mut output = text.to_string();
    for (entity, replacement) in ENTITY_REPLACEMENTS {
        output = output.replace(entity, replacement);
    }
    output
}

/// Periods in wiki titles collide with Redmine's title routing.
fn strip_title(page_name: &str) -> String {
    page_name.replace('.', "")
}

fn date_part(timestamp: &str) -> &str {
    timestamp.get(..10).unwrap_or(timestamp)
}
