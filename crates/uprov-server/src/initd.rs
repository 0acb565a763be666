//! Debian /etc/init.d script generation for `--initd`.

use std::path::Path;

const TEMPLATE: &str = r#"#!/bin/sh
### BEGIN INIT INFO
# Provides:        ${NAME}
# Required-Start:  $network
# Required-Stop:   $network
# Default-Start:   2 3 4 5
# Default-Stop:    0 1 6
# Short-Description: Device provisioning provider
### END INIT INFO

PATH=/bin:/usr/bin:/usr/local/bin
PROGRAM=${PROGRAM}
ARGS="-s ${SERVER}"

case "$1" in
	start)
		echo "start ${NAME}"
		$PROGRAM $ARGS >> /var/log/${NAME}.log 2>&1 &
		;;
	stop)
		echo "stop ${NAME}"
		killall ${NAME}
		;;
	*)
		echo "Usage: service ${NAME} <start|stop>"
		exit 1
		;;
esac
# enable start on boot with: update-rc.d ${NAME} defaults
"#;

/// Script for the current executable.
pub fn generate(server: &str) -> std::io::Result<String> {
    let program = std::env::current_exe()?;
    Ok(render(&program, server))
}

pub fn render(program: &Path, server: &str) -> String {
    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "uprov".to_string());
    TEMPLATE
        .replace("${NAME}", &name)
        .replace("${PROGRAM}", &program.to_string_lossy())
        .replace("${SERVER}", server)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_name_program_and_server() {
        let script = render(Path::new("/usr/local/bin/uprov"), "10.0.0.1:7700");
        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains("PROGRAM=/usr/local/bin/uprov"));
        assert!(script.contains("ARGS=\"-s 10.0.0.1:7700\""));
        assert!(script.contains("echo \"start uprov\""));
        assert!(script.contains("killall uprov"));
        assert!(!script.contains("${"), "unsubstituted placeholder left");
    }
}
