use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use colored::{ColoredString, Colorize};
use commitvault_core::{
    EffectiveStatus, Error, FileState, MergeRequestId, MergeRequestStatus, MergeStrategy,
    NewMergeRequest, RepositoryId, ReviewDecision, Vault,
};

#[derive(Subcommand)]
pub enum MrCommand {
    /// Open a merge request from one branch into another
    Open {
        /// Repository identifier
        repo: String,

        /// Branch with the proposed changes
        source: String,

        /// Branch to merge into
        #[arg(default_value = "main")]
        target: String,

        /// Short title
        #[arg(short, long)]
        title: String,

        /// Longer description
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Record a review decision
    Review {
        /// Merge request id
        id: String,

        /// Decision
        #[arg(value_enum)]
        decision: DecisionArg,

        /// Optional comment
        #[arg(short, long)]
        comment: Option<String>,
    },

    /// Merge the source branch into the target branch
    Merge {
        /// Merge request id
        id: String,

        /// Use the files at this revision as the resolved merge result
        #[arg(long)]
        resolved_from: Option<String>,
    },

    /// Close without merging
    Close {
        /// Merge request id
        id: String,
    },

    /// List merge requests of a repository
    List {
        /// Repository identifier
        repo: String,

        /// Only show requests with this stored status
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },

    /// Show a merge request and its review log
    Show {
        /// Merge request id
        id: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum DecisionArg {
    Approve,
    Reject,
    RequestChanges,
    Comment,
}

impl From<DecisionArg> for ReviewDecision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::Approve => ReviewDecision::Approved,
            DecisionArg::Reject => ReviewDecision::Rejected,
            DecisionArg::RequestChanges => ReviewDecision::ChangesRequested,
            DecisionArg::Comment => ReviewDecision::Commented,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Open,
    Merged,
    Closed,
}

impl From<StatusArg> for MergeRequestStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Open => MergeRequestStatus::Open,
            StatusArg::Merged => MergeRequestStatus::Merged,
            StatusArg::Closed => MergeRequestStatus::Closed,
        }
    }
}

pub fn run(vault: &Vault, author: &str, command: MrCommand) -> Result<()> {
    let engine = vault.merge_requests();

    match command {
        MrCommand::Open {
            repo,
            source,
            target,
            title,
            description,
        } => {
            let repo = RepositoryId::new(repo);
            let id = engine.open(
                &repo,
                NewMergeRequest::new(author, title, source.as_str(), target.as_str())
                    .with_description(description),
            )?;

            println!("{}", "✓ Merge request opened".green().bold());
            println!("  {}: {}", "ID".bold(), id);
            println!("  {}: {} → {}", "Branches".bold(), source, target);
        }
        MrCommand::Review {
            id,
            decision,
            comment,
        } => {
            let id = parse_id(&id)?;
            let decision = ReviewDecision::from(decision);
            engine.submit_review(&id, author, decision, comment)?;

            println!(
                "{} {} {}",
                "✓ Review recorded:".green().bold(),
                author,
                decision.as_str()
            );
            println!(
                "  {}: {}",
                "Status".bold(),
                effective_label(engine.effective_status(&id)?)
            );
        }
        MrCommand::Merge { id, resolved_from } => {
            let id = parse_id(&id)?;
            let resolved = match resolved_from {
                Some(rev) => Some(resolved_state(vault, &id, &rev)?),
                None => None,
            };

            match engine.merge(&id, author, resolved) {
                Ok(outcome) => {
                    let how = match outcome.strategy {
                        MergeStrategy::UpToDate => "already up to date",
                        MergeStrategy::FastForward => "fast-forward",
                        MergeStrategy::MergeCommit => "merge commit",
                    };
                    println!("{} ({})", "✓ Merged".green().bold(), how);
                    println!("  {}: {}", "Commit".bold(), outcome.commit);
                }
                Err(Error::MergeConflict { paths }) => {
                    println!("{}", "Merge conflict".red().bold());
                    for path in &paths {
                        println!("  {} {}", "!".red(), path);
                    }
                    println!();
                    println!(
                        "Commit a resolution to a branch and run {}",
                        "cvault mr merge <id> --resolved-from <branch>".cyan()
                    );
                    anyhow::bail!("{} conflicting path(s)", paths.len());
                }
                Err(e) if e.is_retriable() => {
                    return Err(e).context("Target branch moved during the merge; try again");
                }
                Err(e) => return Err(e.into()),
            }
        }
        MrCommand::Close { id } => {
            let id = parse_id(&id)?;
            engine.close(&id, author)?;
            println!("{} {}", "✓ Closed merge request".green().bold(), id);
        }
        MrCommand::List { repo, status } => {
            let repo = RepositoryId::new(repo);
            let requests = engine.list(&repo, status.map(Into::into))?;
            if requests.is_empty() {
                println!("{}", "No merge requests".yellow());
                return Ok(());
            }

            println!("{}", "Merge Requests".bold().cyan());
            for request in requests {
                println!(
                    "  {} {} {} → {} {}",
                    request.id.to_string().dimmed(),
                    effective_label(engine.effective_status(&request.id)?),
                    request.source_branch,
                    request.target_branch,
                    request.title.bold()
                );
            }
        }
        MrCommand::Show { id } => {
            let id = parse_id(&id)?;
            let request = engine.get(&id)?;

            println!("{} {}", request.title.bold().cyan(), format!("({})", request.id).dimmed());
            println!(
                "  {}: {}",
                "Status".bold(),
                effective_label(engine.effective_status(&id)?)
            );
            println!(
                "  {}: {} → {}",
                "Branches".bold(),
                request.source_branch,
                request.target_branch
            );
            println!("  {}: {}", "Creator".bold(), request.creator);
            println!(
                "  {}: {}",
                "Opened".bold(),
                request.created_at.format("%Y-%m-%d %H:%M:%S")
            );
            if let (Some(by), Some(at)) = (&request.resolved_by, request.resolved_at) {
                println!(
                    "  {}: {} at {}",
                    "Resolved by".bold(),
                    by,
                    at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            if let Some(commit) = &request.merge_commit {
                println!("  {}: {}", "Merge commit".bold(), commit);
            }
            if !request.description.is_empty() {
                println!();
                for line in request.description.lines() {
                    println!("    {}", line);
                }
            }

            let reviews = engine.reviews(&id)?;
            if !reviews.is_empty() {
                println!();
                println!("{}", "Reviews".bold());
                for review in reviews {
                    println!(
                        "  {} {} {}",
                        review.timestamp.format("%Y-%m-%d %H:%M").to_string().dimmed(),
                        review.reviewer.bold(),
                        review.decision.as_str()
                    );
                    if let Some(comment) = review.comment {
                        println!("      {}", comment);
                    }
                }
            }
        }
    }

    Ok(())
}

fn parse_id(id: &str) -> Result<MergeRequestId> {
    MergeRequestId::parse(id).with_context(|| format!("'{}' is not a merge request id", id))
}

fn resolved_state(vault: &Vault, id: &MergeRequestId, rev: &str) -> Result<FileState> {
    let request = vault.merge_requests().get(id)?;
    let commit = super::resolve_revision(vault, &request.repository, rev)?;
    Ok(vault.graph().file_state(&commit)?)
}

fn effective_label(status: EffectiveStatus) -> ColoredString {
    match status {
        EffectiveStatus::Open => "open".cyan(),
        EffectiveStatus::Approved => "approved".green(),
        EffectiveStatus::ChangesRequested => "changes requested".yellow(),
        EffectiveStatus::Rejected => "rejected".red(),
        EffectiveStatus::Merged => "merged".magenta(),
        EffectiveStatus::Closed => "closed".dimmed(),
    }
}
