use std::fs;
use std::path::Path;

use depnet::cli::try_command_from_iter;
use depnet::config::ModelKind;
use depnet::eval::Scores;
use depnet::network::{HEAD_FILE, Interrupt, InterruptChoice, Network, Phase, SCORES_FILE};

const TREEBANK: &str = "\
1\tThe\tthe\tDET\tDT\t_\t2\tdet\t_\t_
2\tdog\tdog\tNOUN\tNN\t_\t3\tnsubj\t_\t_
3\tbarks\tbark\tVERB\tVBZ\t_\t0\troot\t_\t_
4\t.\t.\tPUNCT\t.\t_\t3\tpunct\t_\t_

1\tA\ta\tDET\tDT\t_\t2\tdet\t_\t_
2\tbird\tbird\tNOUN\tNN\t_\t3\tnsubj\t_\t_
3\tsings\tsing\tVERB\tVBZ\t_\t0\troot\t_\t_
4\t.\t.\tPUNCT\t.\t_\t3\tpunct\t_\t_

1\tBirds\tbird\tNOUN\tNNS\t_\t2\tnsubj\t_\t_
2\tsee\tsee\tVERB\tVBP\t_\t0\troot\t_\t_
3\tthe\tthe\tDET\tDT\t_\t4\tdet\t_\t_
4\tdog\tdog\tNOUN\tNN\t_\t2\tobj\t_\t_
5\t.\t.\tPUNCT\t.\t_\t2\tpunct\t_\t_
";

const RUN_CONFIG: &str = "\
[dataset]
n_bkts = 2
min_occur_count = 1

[layers]
word_embed_size = 6
tag_embed_size = 4
recur_size = 5
mlp_size = 6
rel_mlp_size = 4

[regularization]
recur_reg = 0.05
covar_reg = 0.05
ortho_reg = 0.05
embed_keep_prob = 0.9
mlp_keep_prob = 0.9

[radam]
learning_rate = 0.02
epsilon = 1e-8

[training]
pretrain_iters = 2
train_iters = 4
train_batch_size = 20
test_batch_size = 50
print_every = 2
validate_every = 2
save_every = 100
";

fn never() -> InterruptChoice {
    panic!("no interrupt expected")
}

fn write_inputs(dir: &Path) {
    for name in ["train.conllu", "dev.conllu", "test.conllu"] {
        fs::write(dir.join(name), TREEBANK).expect("write treebank");
    }
    fs::write(dir.join("run.toml"), RUN_CONFIG).expect("write config");
}

fn file_args(dir: &Path) -> Vec<String> {
    ["train", "valid", "test"]
        .iter()
        .zip(["train.conllu", "dev.conllu", "test.conllu"])
        .flat_map(|(key, file)| {
            [
                "--set".to_string(),
                format!("os.{key}_file={:?}", dir.join(file).display().to_string()),
            ]
        })
        .collect()
}

fn train_then_test(model: &str, kind: ModelKind) -> Scores {
    let dir = tempfile::tempdir().expect("tempdir");
    write_inputs(dir.path());
    let save_dir = dir.path().join("saves").join(model);

    let mut args = vec![
        "depnet".to_string(),
        "--pretrain".to_string(),
        "--model".to_string(),
        model.to_string(),
        "--config-file".to_string(),
        dir.path().join("run.toml").display().to_string(),
        "--save-dir".to_string(),
        save_dir.display().to_string(),
    ];
    args.extend(file_args(dir.path()));
    let run = try_command_from_iter(args).expect("valid command");
    assert_eq!(run.model_kind, kind);

    let config = run.resolve().expect("config");
    assert_eq!(config.training.train_iters, 4);
    let mut network = Network::new(run.model_kind, config, Interrupt::default()).expect("network");
    network.mark_head(Phase::Training).expect("head");
    network.pretrain(&mut never).expect("pretrain");
    network.train(&mut never).expect("train");
    assert_eq!(network.global_step(), 4);
    assert!(save_dir.join(format!("{model}-pretrained.json")).exists());
    assert!(save_dir.join(model).exists());

    let run = try_command_from_iter([
        "depnet".to_string(),
        "--test".to_string(),
        "--model".to_string(),
        model.to_string(),
        "--save-dir".to_string(),
        save_dir.display().to_string(),
    ])
    .expect("valid command");
    let config = run.resolve().expect("saved config");
    assert_eq!(config.layers.recur_size, 5);
    let mut network = Network::new(run.model_kind, config, Interrupt::default()).expect("network");
    network.mark_head(Phase::Testing).expect("head");
    network.load().expect("load");
    assert_eq!(network.global_step(), 4);
    let scores = network.test(false).expect("test");

    let head = fs::read_to_string(save_dir.join(HEAD_FILE)).expect("HEAD");
    assert!(head.starts_with("Training:\n"));
    assert!(head.contains("\nTesting:\n"));
    let predictions = fs::read_to_string(save_dir.join("test.conllu")).expect("predictions");
    assert_eq!(predictions.lines().filter(|line| line.is_empty()).count(), 3);
    let written = fs::read_to_string(save_dir.join(SCORES_FILE)).expect("scores");
    assert!(written.ends_with(&scores.to_string()));
    scores
}

#[test]
fn parser_run_trains_saves_and_tests() {
    let scores = train_then_test("parser", ModelKind::Parser);
    // 13 tokens, 3 of them punctuation
    assert_eq!(scores.tokens, 10);
    let uas = scores.uas.expect("parser scores heads");
    let las = scores.las.expect("parser scores relations");
    assert!((0.0..=100.0).contains(&uas));
    assert!(las <= uas);
    assert!(scores.xpos.is_none());
}

#[test]
fn tagger_run_trains_saves_and_tests() {
    let scores = train_then_test("tagger", ModelKind::Tagger);
    assert_eq!(scores.tokens, 10);
    assert!(scores.xpos.is_some());
    assert!(scores.uas.is_none());
}
