use std::convert::TryInto;
use std::io::{self, BufRead, Write};
use std::str::FromStr;

use tracing_subscriber::EnvFilter;

use calc_client::models::{AnalyticsSummary, HistoryFilter, HistoryPage, NewUser, Operation, ProfileUpdate};
use calc_client::{Client, Config, Error, SessionState};


#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
        )
        .with_writer(io::stderr)
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!(concat!(
                "could not load config ({}), set CALC_CONFIG ",
                "or write a file to config.json"
            ), err);
            std::process::exit(1);
        },
    };

    let client : Client = match config.try_into() {
        Ok(client) => client,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        },
    };

    let args = std::env::args().collect::<Vec<_>>();
    let args_ref = args.iter().map(|s| s.as_str()).collect::<Vec<_>>();

    // help needs no session
    if let ["help", cmd] = &args_ref[1..] {
        help(cmd);
    }

    let state = match client.resume().await {
        Ok(state) => state,
        Err(err) => {
            eprintln!("{}", err);
            client.session().state()
        },
    };

    let mut session_events = client.session().subscribe();

    let res = run(&client, state, &args_ref[1..]).await;

    let ended = session_events.has_changed().unwrap_or(false)
        && *session_events.borrow_and_update() == SessionState::Anonymous;

    match res {
        Ok(()) => (),
        Err(Error::Unauthorized) => {
            eprintln!("{}", Error::Unauthorized);
            login_view();
            std::process::exit(1);
        },
        Err(err @ Error::Network(_)) => {
            eprintln!("{} (is the server at the configured base_url running?)", err);
            std::process::exit(1);
        },
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(1);
        },
    }

    if ended && state == SessionState::Authenticated {
        login_view();
    }
}

const COMMANDS : &[(&str, &str)] = &[
    ("login", "login user"),
    ("register", "register user email"),
    ("logout", "logout"),
    ("whoami", "whoami"),
    ("calc", "calc operand1 operation operand2, e.g. calc 2 + 3"),
    ("dashboard", "dashboard"),
    ("history", "history [page] [operation]"),
    ("calculations", "calculations [skip] [limit]"),
    ("delete-calculation", "delete-calculation id"),
    ("clear-history", "clear-history"),
    ("set-username", "set-username name"),
    ("set-email", "set-email email"),
    ("change-password", "change-password"),
    ("delete-account", "delete-account"),
];

async fn run(client : &Client, state : SessionState, args : &[&str]) -> Result<(), Error> {
    if state == SessionState::Anonymous && needs_session(args) {
        eprintln!("not logged in");
        login_view();
        std::process::exit(1);
    }

    match args {
        ["login", user] => {
            let pass = prompt_password("password: ");
            let user = client.login(user, &pass).await?;
            println!("logged in as {}", user.username);
        },
        ["register", user, email] => {
            let pass = prompt_password("password: ");
            if prompt_password("repeat password: ") != pass {
                eprintln!("passwords do not match");
                std::process::exit(1);
            }

            client.register(&NewUser{
                username : user.to_string(),
                email : email.to_string(),
                password : pass.clone(),
            }).await?;

            let user = client.login(user, &pass).await?;
            println!("registered and logged in as {}", user.username);
        },
        ["logout"] => {
            client.logout().await?;
            println!("logged out");
        },
        ["whoami"] => {
            let user = client.current_user().await?;
            println!("{} <{}>", user.username, user.email);
        },
        ["calc", a, op, b] => {
            let op = parse_arg::<Operation>(op);
            let res = client.calculate(op, parse_arg(a), parse_arg(b)).await?;
            println!("{} {} {} = {}", res.operand1, op.symbol(), res.operand2, res.result);
        },
        ["dashboard"] => {
            dashboard_view(&client.summary().await?);
        },
        ["history"] => history(client, 0, None).await?,
        ["history", page] => history(client, parse_page(page), None).await?,
        ["history", page, op] => history(client, parse_page(page), Some(parse_arg(op))).await?,
        ["calculations"] => calculations(client, 0, 100).await?,
        ["calculations", skip] => calculations(client, parse_arg(skip), 100).await?,
        ["calculations", skip, limit] => {
            calculations(client, parse_arg(skip), parse_arg(limit)).await?
        },
        ["delete-calculation", id] => {
            client.delete_calculation(parse_arg(id)).await?;
            println!("deleted calculation {}", id);
        },
        ["clear-history"] => {
            if confirm("clear all calculation history?") {
                let n = client.clear_history().await?;
                println!("deleted {} calculations", n);
            }
        },
        ["set-username", name] => {
            let user = client.update_profile(&ProfileUpdate{
                username : Some(name.to_string()),
                ..Default::default()
            }).await?;
            println!("profile updated: {} <{}>", user.username, user.email);
        },
        ["set-email", email] => {
            let user = client.update_profile(&ProfileUpdate{
                email : Some(email.to_string()),
                ..Default::default()
            }).await?;
            println!("profile updated: {} <{}>", user.username, user.email);
        },
        ["change-password"] => {
            let current = prompt_password("current password: ");
            let new = prompt_password("new password: ");
            println!("{}", client.change_password(&current, &new).await?);
        },
        ["delete-account"] => {
            if confirm("delete your account and all calculations?") {
                client.delete_account().await?;
                println!("account deleted");
            }
        },
        args => {
            eprintln!("invalid args: {:?}", args);
            eprintln!("try `calc help cmd` where cmd is:");

            for (cmd, _) in COMMANDS.iter() {
                eprintln!("{}", cmd);
            }

            std::process::exit(1);
        },
    }

    Ok(())
}

fn needs_session(args : &[&str]) -> bool {
    match args.first() {
        Some(cmd) => COMMANDS
            .iter()
            .any(|(c, _)| c == cmd && !matches!(*c, "login" | "register" | "logout")),
        None => false,
    }
}

async fn history(client : &Client, page : u64, op : Option<Operation>) -> Result<(), Error> {
    let mut filter = HistoryFilter::default().page(page);
    filter.operation = op;

    history_view(&client.history(&filter).await?);
    Ok(())
}

async fn calculations(client : &Client, skip : u64, limit : u64) -> Result<(), Error> {
    for c in client.calculations(skip, limit).await? {
        println!(
            "#{:<5} {} {} {} = {}",
            c.id, c.operand1, c.operation.symbol(), c.operand2, c.result,
        );
    }

    Ok(())
}

fn login_view() {
    eprintln!("log in with `calc login <user>` or create an account with `calc register <user> <email>`");
}

fn dashboard_view(summary : &AnalyticsSummary) {
    println!("total calculations: {}", summary.total_calculations);
    println!(
        "most used:          {}",
        summary.most_used_operation.as_deref().unwrap_or("N/A")
    );
    match summary.average_result {
        Some(avg) => println!("average result:     {:.2}", avg),
        None => println!("average result:     N/A"),
    }

    if summary.operations_breakdown.is_empty() {
        println!("no calculations yet");
        return
    }

    for op in summary.operations_breakdown.iter() {
        println!("  {:<10} {} ({:.1}%)", op.operation, op.count, op.percentage);
    }
}

fn history_view(page : &HistoryPage) {
    if page.items.is_empty() {
        println!("no calculations found");
        return
    }

    println!("{:<10} {:>12} {:>12} {:>14}  {}", "operation", "operand1", "operand2", "result", "date");
    for c in page.items.iter() {
        println!(
            "{:<10} {:>12} {:>12} {:>14}  {}",
            c.operation,
            c.operand1,
            c.operand2,
            c.result,
            c.created_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
        );
    }

    println!("page {} of {}", page.page() + 1, page.page_count().max(1));
    if page.has_more {
        println!("next: calc history {}", page.page() + 1);
    }
}

fn parse_arg<T : FromStr>(s : &str) -> T
where
    T::Err : std::fmt::Display,
{
    match s.parse() {
        Ok(v) => v,
        Err(err) => {
            eprintln!("invalid argument {:?}: {}", s, err);
            std::process::exit(1);
        },
    }
}

/// Pages are shown one based.
fn parse_page(s : &str) -> u64 {
    parse_arg::<u64>(s).saturating_sub(1)
}

fn prompt_password(prompt : &str) -> String {
    match rpassword::prompt_password_stdout(prompt) {
        Ok(pass) => pass,
        Err(err) => {
            eprintln!("could not read password: {}", err);
            std::process::exit(1);
        },
    }
}

fn confirm(question : &str) -> bool {
    print!("{} [y/N] ", question);
    let _ = io::stdout().flush();

    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line).is_err() {
        return false
    }

    matches!(line.trim(), "y" | "Y" | "yes")
}

fn help(cmd : &str) -> ! {
    match COMMANDS.iter().find(|(c, _)| *c == cmd) {
        Some((_, usage)) => {
            println!("usage: calc {}", usage);
            std::process::exit(0)
        },
        None => {
            eprintln!("unknown command {}", cmd);
            std::process::exit(1)
        },
    }
}
