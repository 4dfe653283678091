// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Redis command obfuscation.
//!
//! Commands keep their verb and the arguments that identify the key space;
//! value-carrying arguments collapse into a single `?`. Each line of a
//! pipelined command is handled independently.

/// Number of leading arguments preserved for a command verb. `None` keeps
/// every argument.
fn args_to_keep(command: &str) -> Option<usize> {
    let upper = command.to_ascii_uppercase();
    match upper.as_str() {
        "AUTH" => Some(0),
        "APPEND" | "GETSET" | "LPUSHX" | "GEORADIUSBYMEMBER" | "RPUSHX" | "SET" | "SETNX"
        | "SISMEMBER" | "ZRANK" | "ZREVRANK" | "ZSCORE" => Some(1),
        "HSET" | "HSETNX" | "LREM" | "LSET" | "SETBIT" | "SETEX" | "PSETEX" | "SETRANGE"
        | "ZINCRBY" | "SMOVE" | "RESTORE" => Some(2),
        "GEOADD" => Some(3),
        _ => None,
    }
}

fn obfuscate_command_line(line: &str) -> String {
    let mut tokens = line.split_whitespace();
    let Some(command) = tokens.next() else {
        return String::new();
    };

    let mut out = command.to_string();
    match args_to_keep(command) {
        None => {
            for token in tokens {
                out.push(' ');
                out.push_str(token);
            }
        }
        Some(keep) => {
            let mut hidden = false;
            for (index, token) in tokens.enumerate() {
                if index < keep {
                    out.push(' ');
                    out.push_str(token);
                } else if !hidden {
                    out.push_str(" ?");
                    hidden = true;
                }
            }
        }
    }
    out
}

/// Obfuscate the value-carrying arguments of a raw Redis command.
pub fn obfuscate_redis_string(command: &str) -> String {
    command
        .lines()
        .map(obfuscate_command_line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Replace every argument of every command with a single `?`.
pub fn remove_all_redis_args(command: &str) -> String {
    command
        .lines()
        .map(|line| {
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                None => String::new(),
                Some(verb) => {
                    if tokens.next().is_some() {
                        format!("{verb} ?")
                    } else {
                        verb.to_string()
                    }
                }
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_geoadd_coordinates() {
        assert_eq!(
            obfuscate_redis_string("GEOADD key longitude latitude member"),
            "GEOADD key longitude latitude ?"
        );
    }

    #[test]
    fn set_keeps_only_the_key() {
        assert_eq!(obfuscate_redis_string("SET mykey myvalue"), "SET mykey ?");
        assert_eq!(
            obfuscate_redis_string("SET mykey myvalue EX 60"),
            "SET mykey ?"
        );
    }

    #[test]
    fn auth_hides_everything() {
        assert_eq!(obfuscate_redis_string("AUTH hunter2"), "AUTH ?");
    }

    #[test]
    fn hset_keeps_key_and_field() {
        assert_eq!(
            obfuscate_redis_string("HSET myhash field1 secret"),
            "HSET myhash field1 ?"
        );
    }

    #[test]
    fn unlisted_commands_are_untouched() {
        assert_eq!(obfuscate_redis_string("GET mykey"), "GET mykey");
        assert_eq!(obfuscate_redis_string("DEL a b c"), "DEL a b c");
    }

    #[test]
    fn command_case_is_preserved() {
        assert_eq!(obfuscate_redis_string("set mykey value"), "set mykey ?");
    }

    #[test]
    fn pipelined_commands_handled_per_line() {
        assert_eq!(
            obfuscate_redis_string("SET k v\nGET k\nAUTH pass"),
            "SET k ?\nGET k\nAUTH ?"
        );
    }

    #[test]
    fn remove_all_args_keeps_verbs() {
        assert_eq!(
            remove_all_redis_args("GEOADD key longitude latitude member"),
            "GEOADD ?"
        );
        assert_eq!(remove_all_redis_args("PING"), "PING");
        assert_eq!(remove_all_redis_args("SET k v\nGET k"), "SET ?\nGET ?");
    }
}
