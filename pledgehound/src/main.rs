use colored::Colorize;
use pledgehound::commands::command_argument_builder;
use pledgehound::handlers::{
    handle_accounts_add, handle_accounts_list, handle_accounts_reset, handle_blocked,
    handle_contacts, handle_init, handle_run, init_logging, print_banner,
};

#[tokio::main]
async fn main() {
    let cmd = command_argument_builder();
    let chosen_command = cmd.get_matches();
    let quiet = chosen_command.get_flag("quiet");
    let debug = chosen_command.get_flag("debug");

    // Show banner unless --quiet flag is set
    if !quiet {
        print_banner();
    }

    init_logging(debug);

    let result = match chosen_command.subcommand() {
        Some(("init", primary_command)) => handle_init(primary_command),
        Some(("run", primary_command)) => handle_run(primary_command, quiet).await,
        Some(("contacts", primary_command)) => handle_contacts(primary_command, quiet).await,
        Some(("accounts", primary_command)) => match primary_command.subcommand() {
            Some(("add", secondary_command)) => handle_accounts_add(secondary_command),
            Some(("list", secondary_command)) => handle_accounts_list(secondary_command),
            Some(("reset", secondary_command)) => handle_accounts_reset(secondary_command),
            _ => unreachable!("clap should ensure we don't get here"),
        },
        Some(("blocked", primary_command)) => handle_blocked(primary_command),
        _ => unreachable!("clap should ensure we don't get here"),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "✗".red().bold(), e);
        std::process::exit(1);
    }
}
