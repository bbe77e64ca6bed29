use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <socket> [who | disconnect <username>]", args[0]);
        eprintln!("Example: {} /var/run/pppacd.sock who", args[0]);
        std::process::exit(1);
    }

    let socket_path = &args[1];
    let command = args.get(2).map(|s| s.as_str()).unwrap_or("who");

    let request = match command {
        "who" => "{\"command\":\"who\"}".to_string(),
        "disconnect" => {
            let username = args.get(3).ok_or("disconnect needs a username")?;
            format!(
                "{{\"command\":\"disconnect-user\",\"username\":{}}}",
                serde_json::to_string(username)?
            )
        }
        other => {
            eprintln!("unknown command '{}'", other);
            std::process::exit(1);
        }
    };

    let stream = UnixStream::connect(socket_path)?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    writer.write_all(request.as_bytes())?;
    writer.write_all(b"\n")?;

    // `who` answers with one or more chunks; everything else with a
    // single record.
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let value: serde_json::Value = serde_json::from_str(&line)?;
        if value["status"] != 0 {
            eprintln!("error: {}", value["error"]);
            std::process::exit(1);
        }

        if let Some(count) = value.get("count") {
            println!("{} session(s) stopped", count);
            break;
        }
        if let Some(sessions) = value["sessions"].as_array() {
            for session in sessions {
                println!(
                    "{:>6}  {:<24} {:<10} {:<15} {} in / {} out",
                    session["id"],
                    session["username"].as_str().unwrap_or("-"),
                    session["protocol"].as_str().unwrap_or("-"),
                    session["address"].as_str().unwrap_or("-"),
                    session["stats"]["input_octets"],
                    session["stats"]["output_octets"],
                );
            }
        }
        if value["more"] != true {
            break;
        }
    }

    Ok(())
}
