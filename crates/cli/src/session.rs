use crate::profile::KeyWatcher;
use li_connect_linkedin::flow::{ConnectFlow, FlowNotice};
use li_connect_linkedin::reconciler::SelectionState;
use li_connect_linkedin::refresher::AccountSource;
use li_connect_linkedin::selector::SelectionBackend;
use li_connect_linkedin::{now_millis, AccountChoice};
use std::io::BufRead;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Choose(AccountChoice),
    Dismiss,
    Refresh,
    Quit,
    Invalid(String),
}

pub fn parse_answer(text: &str, options: &[AccountChoice]) -> Answer {
    let text = text.trim();
    match text.to_lowercase().as_str() {
        "q" | "quit" | "exit" => return Answer::Quit,
        "d" | "dismiss" | "cancel" => return Answer::Dismiss,
        "r" | "refresh" => return Answer::Refresh,
        _ => {}
    }

    let indexed = text
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| options.get(i));
    if let Some(choice) = indexed {
        return Answer::Choose(choice.clone());
    }

    options
        .iter()
        .find(|choice| {
            choice.label().eq_ignore_ascii_case(text) || choice.organization_id() == Some(text)
        })
        .cloned()
        .map(Answer::Choose)
        .unwrap_or_else(|| Answer::Invalid(format!("Unknown option: {text}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopWhen {
    Resolved,
    PromptClosed,
    Never,
}

impl StopWhen {
    fn reached(self, state: &SelectionState) -> bool {
        match self {
            StopWhen::Resolved => matches!(state, SelectionState::Resolved(_)),
            StopWhen::PromptClosed => !state.is_prompting(),
            StopWhen::Never => false,
        }
    }
}

fn render(notice: FlowNotice, options: &mut Vec<AccountChoice>) {
    match notice {
        FlowNotice::Prompt { options: offered } => {
            println!("Choose where to post on LinkedIn:");
            for (i, choice) in offered.iter().enumerate() {
                println!("  {}) {}", i + 1, choice.label());
            }
            println!("Enter a number, or d to dismiss.");
            *options = offered;
        }
        FlowNotice::PromptClosed => options.clear(),
        FlowNotice::Notify(notice) => println!("{}", notice.text()),
        FlowNotice::Connected { organization } => {
            println!("{} is already connected", organization.display_name());
        }
    }
}

fn drain(notices: &mut mpsc::UnboundedReceiver<FlowNotice>, options: &mut Vec<AccountChoice>) {
    while let Ok(notice) = notices.try_recv() {
        render(notice, options);
    }
}

/// Reads lines on a plain thread so a pending read never holds up runtime shutdown.
pub fn spawn_line_reader<R>(reader: R) -> mpsc::UnboundedReceiver<String>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

pub async fn run<B>(
    flow: &mut ConnectFlow<B>,
    notices: &mut mpsc::UnboundedReceiver<FlowNotice>,
    input: &mut mpsc::UnboundedReceiver<String>,
    mut watcher: KeyWatcher,
    stop: StopWhen,
) where
    B: AccountSource + SelectionBackend + 'static,
{
    let mut options = Vec::new();
    let mut input_open = true;
    let mut poll = tokio::time::interval(POLL_INTERVAL);

    loop {
        drain(notices, &mut options);
        if stop.reached(flow.state()) {
            break;
        }

        tokio::select! {
            Some(notice) = notices.recv() => render(notice, &mut options),
            alive = flow.next_event() => {
                if !alive {
                    break;
                }
            }
            line = input.recv(), if input_open => {
                let line = match line {
                    Some(line) => line,
                    None => {
                        input_open = false;
                        if stop == StopWhen::PromptClosed {
                            break;
                        }
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_answer(&line, &options) {
                    Answer::Quit => break,
                    Answer::Dismiss => flow.dismiss(),
                    Answer::Refresh => flow.on_focus(),
                    Answer::Choose(_) if flow.selector().is_some_and(|s| s.is_disabled()) => {
                        println!("A selection is already being submitted");
                    }
                    Answer::Choose(choice) => flow.choose(choice),
                    Answer::Invalid(reason) => println!("{reason}"),
                }
            }
            _ = poll.tick() => {
                if let Some(event) = watcher.poll() {
                    debug!(key = %event.key, "Storage changed");
                    flow.on_storage_event(&event);
                }
                flow.tick(now_millis());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    flow.unmount();
    drain(notices, &mut options);
}

#[cfg(test)]
mod tests {
    use super::*;
    use li_connect_linkedin::channel::OriginPolicy;
    use li_connect_linkedin::reconciler::Resolution;
    use li_connect_linkedin::store::{write_json, MemoryStore, OAUTH_RESULT_KEY};
    use li_connect_linkedin::{Account, ApiResult, OAuthResult, Organization, SelectionRequest, Team};
    use std::io::{BufReader, Read};
    use std::sync::{mpsc as std_mpsc, Arc};
    use std::time::Instant;

    struct EmptyBackend;

    impl AccountSource for EmptyBackend {
        async fn list_accounts(&self) -> ApiResult<Vec<Account>> {
            Ok(Vec::new())
        }

        async fn list_teams(&self) -> ApiResult<Vec<Team>> {
            Ok(Vec::new())
        }
    }

    impl SelectionBackend for EmptyBackend {
        async fn submit_selection(&self, _request: &SelectionRequest) -> ApiResult<Option<Account>> {
            Ok(None)
        }
    }

    struct IdleTerminal(std_mpsc::Receiver<()>);

    impl Read for IdleTerminal {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    fn options() -> Vec<AccountChoice> {
        vec![
            AccountChoice::Personal,
            AccountChoice::Organization(Organization {
                id: "42".to_string(),
                name: "Acme".to_string(),
                vanity_name: None,
                logo: None,
            }),
        ]
    }

    #[test]
    fn numbers_pick_offered_options() {
        assert_eq!(parse_answer("1", &options()), Answer::Choose(AccountChoice::Personal));
        assert_eq!(parse_answer(" 2 ", &options()), Answer::Choose(options()[1].clone()));
        assert!(matches!(parse_answer("3", &options()), Answer::Invalid(_)));
        assert!(matches!(parse_answer("0", &options()), Answer::Invalid(_)));
    }

    #[test]
    fn labels_and_ids_pick_options() {
        assert_eq!(parse_answer("acme", &options()), Answer::Choose(options()[1].clone()));
        assert_eq!(parse_answer("42", &options()), Answer::Choose(options()[1].clone()));
        assert_eq!(
            parse_answer("personal profile", &options()),
            Answer::Choose(AccountChoice::Personal)
        );
    }

    #[test]
    fn commands_work_without_a_prompt() {
        assert_eq!(parse_answer("q", &[]), Answer::Quit);
        assert_eq!(parse_answer("Dismiss", &[]), Answer::Dismiss);
        assert_eq!(parse_answer("r", &[]), Answer::Refresh);
        assert!(matches!(parse_answer("1", &[]), Answer::Invalid(_)));
    }

    #[test]
    fn result_from_another_tab_ends_session_while_terminal_is_idle() {
        let (_keep_open, idle) = std_mpsc::channel::<()>();
        let started = Instant::now();
        let rt = tokio::runtime::Runtime::new().expect("runtime");

        let finished = rt.block_on(async {
            let durable = MemoryStore::shared();
            let (notice_tx, mut notices) = mpsc::unbounded_channel();
            let mut flow = ConnectFlow::new(
                Arc::new(EmptyBackend),
                durable.clone(),
                MemoryStore::shared(),
                OriginPolicy::for_app("http://localhost:3000", None),
                notice_tx,
            );
            flow.mount(None);
            flow.begin_attempt();
            let watcher = KeyWatcher::new(durable.clone(), OAUTH_RESULT_KEY);
            let mut input = spawn_line_reader(BufReader::new(IdleTerminal(idle)));

            write_json(durable.as_ref(), OAUTH_RESULT_KEY, &OAuthResult::success(now_millis()))
                .expect("persist");

            let outcome = tokio::time::timeout(
                Duration::from_secs(5),
                run(&mut flow, &mut notices, &mut input, watcher, StopWhen::Resolved),
            )
            .await;
            outcome.is_ok() && matches!(flow.state(), SelectionState::Resolved(_))
        });
        drop(rt);

        assert!(finished);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn line_reader_forwards_lines_then_closes() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let lines = rt.block_on(async {
            let mut input = spawn_line_reader(std::io::Cursor::new("1\nq\n"));
            let mut lines = Vec::new();
            while let Some(line) = input.recv().await {
                lines.push(line);
            }
            lines
        });
        assert_eq!(lines, vec!["1".to_string(), "q".to_string()]);
    }

    #[test]
    fn stop_conditions() {
        let resolved = SelectionState::Resolved(Resolution::Connected { name: None });
        assert!(StopWhen::Resolved.reached(&resolved));
        assert!(!StopWhen::Resolved.reached(&SelectionState::AwaitingResult));
        assert!(StopWhen::PromptClosed.reached(&SelectionState::AwaitingResult));
        assert!(!StopWhen::Never.reached(&resolved));
    }
}
