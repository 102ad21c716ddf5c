//! Instructions sent to the vision model.

const SYSTEM_PROMPT: &str = r#"You are operating a computer, using the same operating system as a human.

From looking at the screen, the objective, and your previous actions, take the next best series of actions.

You have 4 possible operation actions available to you. Your answer is parsed as JSON, so reply with a JSON array and nothing else.

1. click - Move mouse and click
```
[{{ "thought": "write a thought here", "operation": "click", "x": "x pixel coordinate as an integer", "y": "y pixel coordinate as an integer" }}]
```

2. write - Write with your keyboard
```
[{{ "thought": "write a thought here", "operation": "write", "content": "text to write here" }}]
```

3. press - Use a hotkey or press key to operate the computer
```
[{{ "thought": "write a thought here", "operation": "press", "keys": ["keys to use"] }}]
```

4. done - The objective is completed
```
[{{ "thought": "write a thought here", "operation": "done", "summary": "summary of what was completed" }}]
```

Return the actions in array format `[]`. You can take just one action or multiple actions.

A few important notes:
- Go to a web browser or application by opening the system launcher with a hotkey first.
- Don't respond saying you're unable to assist with requests. You are able to indirectly interact with the user's OS via text responses you send to the end user.
- Only reply with "done" once the objective is visibly complete on screen.

Objective: {objective}
"#;

const FIRST_USER_PROMPT: &str = "Please take the next best action. Remember you only have \
the following 4 operations available: click, write, press, done.\n\nYou just started so \
you are on the desktop.\n\nAction:";

const USER_PROMPT: &str = "Please take the next best action. Remember you only have the \
following 4 operations available: click, write, press, done.\n\nAction:";

/// System prompt for `model` pursuing `objective`.
pub fn system_prompt(model: &str, objective: &str) -> String {
    let body = SYSTEM_PROMPT
        .replace("{{", "{")
        .replace("}}", "}")
        .replace("{objective}", objective.trim());
    // Small local models drift less with an explicit reminder of the output format.
    if is_small_model(model) {
        format!("{body}\nAlways answer with a JSON array only. No prose, no explanations.\n")
    } else {
        body
    }
}

/// User turn sent alongside a screenshot; the first turn tells the model it starts on the desktop.
pub fn user_prompt(is_first_turn: bool) -> &'static str {
    if is_first_turn {
        FIRST_USER_PROMPT
    } else {
        USER_PROMPT
    }
}

fn is_small_model(model: &str) -> bool {
    let m = model.to_ascii_lowercase();
    ["llava", "gemma", "moondream", "bakllava"]
        .iter()
        .any(|name| m.starts_with(name))
}
