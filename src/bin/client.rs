//! Interactive client: play the counting game or compile a file remotely.

use {
    clap::Parser,
    log::debug,
    offload::{
        error::TransportError,
        framed::FramedChannel,
        game::{INITIAL_REMAINING, MAX_TAKE, WIN_SENTINEL},
        handler::{COMPILE_FAILED, READY},
        CHUNK_SIZE,
    },
    std::{
        fs::{self, File},
        io::{self, BufRead, Read, Write},
        net::TcpStream,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
    },
};

#[derive(Parser, Debug)]
#[command(about = "Interactive client for the offload server")]
struct Args {
    #[arg(long, env = "OFFLOAD_ADDR", default_value = "127.0.0.1:5000")]
    addr: String,
}

type Channel = FramedChannel<TcpStream>;

fn prompt(text: &str) -> io::Result<()> {
    print!("{text}");
    io::stdout().flush()
}

/// Next trimmed line from stdin, `None` at end of input.
fn read_line(input: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn progress(label: &str, done: usize, total: usize) {
    let percent = if total == 0 { 100 } else { done * 100 / total };
    print!(
        "\r{label}: [{}{}] {percent}%",
        "#".repeat(percent / 2),
        " ".repeat(50 - percent / 2)
    );
    let _ = io::stdout().flush();
}

fn read_move(input: &mut impl BufRead) -> io::Result<Option<u32>> {
    loop {
        let Some(line) = read_line(input)? else {
            return Ok(None);
        };
        match line.parse::<u32>() {
            Ok(n) if (1..=MAX_TAKE).contains(&n) => return Ok(Some(n)),
            _ => prompt(&format!("Enter a number between 1 and {MAX_TAKE}: "))?,
        }
    }
}

fn play(channel: &mut Channel, input: &mut impl BufRead) -> Result<(), Box<dyn std::error::Error>> {
    channel.send_string("play")?;
    if channel.receive_string()? != READY {
        println!("Something bad happened on the server. Try later...");
        return Ok(());
    }

    prompt(&format!("There are {INITIAL_REMAINING} stones. Your turn: "))?;
    loop {
        let Some(n) = read_move(input)? else {
            return Ok(());
        };
        channel.send_string(&n.to_string())?;

        let reply = channel.receive_string()?;
        if reply == WIN_SENTINEL {
            println!("You won!");
            return Ok(());
        }
        let Some((taken, left)) = reply.split_once('|') else {
            println!("The game was interrupted by the server.");
            return Ok(());
        };
        println!("Computer took {taken} stones.");
        if left == "0" {
            println!("You lost!");
            return Ok(());
        }
        prompt(&format!("There are {left} stones. Your turn: "))?;
    }
}

/// `dir/name.cpp` becomes `dir/name_compiled`.
fn compiled_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    source.with_file_name(format!("{stem}_compiled"))
}

fn compile(channel: &mut Channel, input: &mut impl BufRead) -> Result<(), Box<dyn std::error::Error>> {
    prompt("Enter path to .cpp file: ")?;
    let (path, mut file) = loop {
        let Some(line) = read_line(input)? else {
            return Ok(());
        };
        match File::open(&line) {
            Ok(file) => break (PathBuf::from(line), file),
            Err(e) => prompt(&format!("Unable to open <{line}>: {e}\nTry again: "))?,
        }
    };

    let mut source = Vec::new();
    file.read_to_end(&mut source)?;
    let chunks: Vec<&[u8]> = source.chunks(CHUNK_SIZE).collect();

    channel.send_string("compile")?;
    channel.send_string(&chunks.len().to_string())?;
    let mut sent = 0;
    for chunk in &chunks {
        channel.send(chunk)?;
        sent += chunk.len();
        progress("Sending", sent, source.len());
    }
    println!();

    let answer = channel.receive_string()?;
    if answer == COMPILE_FAILED {
        println!("Compilation failed.");
        return Ok(());
    }
    let count: usize = answer.parse()?;

    let target = compiled_path(&path);
    let mut out = File::create(&target)?;
    for i in 0..count {
        out.write_all(&channel.receive()?)?;
        progress("Receiving", i + 1, count);
    }
    println!();
    drop(out);
    fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;
    println!("Got compiled file.\nSaved to: {}", target.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let stream = TcpStream::connect(&args.addr)?;
    debug!("connected to {}", args.addr);
    let mut channel = FramedChannel::new(stream);

    println!("Connected to server.\nAvailable commands:\n  1. play\n  2. compile\n  3. exit\n");
    let stdin = io::stdin();
    let mut input = stdin.lock();
    loop {
        prompt("> ")?;
        let Some(command) = read_line(&mut input)? else {
            channel.send_string("exit")?;
            return Ok(());
        };
        let result = match command.as_str() {
            "exit" => {
                channel.send_string("exit")?;
                return Ok(());
            }
            "play" => play(&mut channel, &mut input),
            "compile" => compile(&mut channel, &mut input),
            "" => Ok(()),
            other => {
                println!("Unknown command {other:?}");
                Ok(())
            }
        };
        if let Err(e) = result {
            if matches!(e.downcast_ref::<TransportError>(), Some(TransportError::Closed)) {
                println!("Server closed the connection.");
                return Ok(());
            }
            return Err(e);
        }
    }
}
